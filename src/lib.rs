pub mod command_line;
pub mod handler;
pub mod console;
pub mod env;
pub mod net;  // 포트 기반 서비스 런처
pub mod monitor;
pub mod config;  // TOML layer for the runner binary
pub mod utils;
