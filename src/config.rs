//! Resolves server configuration from environment variables, with a second
//! CLI-flag pass overriding them — the same env-first, flags-override shape
//! the teacher binary uses for `BIND_ADDR`/`LOG_LEVEL`.

use std::path::PathBuf;

use crate::wire::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub address: Address,
    pub data_path: PathBuf,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Address { host: "0.0.0.0".into(), port: 8080, secure: false },
            data_path: PathBuf::from("./data"),
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Resolves from `APPHUB_BIND_HOST` / `APPHUB_BIND_PORT` / `APPHUB_SECURE`
    /// / `APPHUB_DATA_PATH` / `LOG_LEVEL`, then applies `--host`, `--port`,
    /// `--secure`, `--data-path` flags from `args` over whatever the
    /// environment produced.
    pub fn resolve(args: impl Iterator<Item = String>) -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("APPHUB_BIND_HOST") {
            config.address.host = host;
        }
        if let Ok(port) = std::env::var("APPHUB_BIND_PORT") {
            if let Ok(port) = port.parse() {
                config.address.port = port;
            }
        }
        if let Ok(secure) = std::env::var("APPHUB_SECURE") {
            config.address.secure = secure == "1" || secure.eq_ignore_ascii_case("true");
        }
        if let Ok(data_path) = std::env::var("APPHUB_DATA_PATH") {
            config.data_path = PathBuf::from(data_path);
        }
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = log_level;
        }

        let mut args = args.peekable();
        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--host" => {
                    if let Some(value) = args.next() {
                        config.address.host = value;
                    }
                }
                "--port" => {
                    if let Some(value) = args.next() {
                        if let Ok(port) = value.parse() {
                            config.address.port = port;
                        }
                    }
                }
                "--secure" => config.address.secure = true,
                "--data-path" => {
                    if let Some(value) = args.next() {
                        config.data_path = PathBuf::from(value);
                    }
                }
                "--log-level" => {
                    if let Some(value) = args.next() {
                        config.log_level = value;
                    }
                }
                _ => {}
            }
        }

        config
    }
}
