//! # LLM 缓存代理服务
//!
//! 入口：加载配置、初始化日志与存储、启动代理服务器

use clap::{Arg, Command};
use llm_proxy::config;
use llm_proxy::logging;
use llm_proxy::proxy::ProxyServer;

#[tokio::main]
async fn main() -> llm_proxy::Result<()> {
    let matches = Command::new("llm-proxy")
        .about("LLM 服务缓存代理")
        .arg(
            Arg::new("config")
                .short('f')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value(config::DEFAULT_CONFIG_FILE),
        )
        .get_matches();

    logging::init_logging();

    let config_file = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(config::DEFAULT_CONFIG_FILE);
    let config = config::load_config(config_file)?;

    let server = ProxyServer::build(config).await?;
    server.run().await
}
