mod commands;
mod config;
mod encoder;
mod error;
mod health;
mod logging;
mod notify;
mod process;
mod retry;
mod source;
mod state;
mod supervisor;
mod web;

use clap::{Parser, Subcommand};
use config::AppConfig;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

/// VTX Relay - 直播转推监管服务
/// 轮询直播间状态, 开播时启动转码进程推流到目标平台, 失败时按策略重启
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-relay.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// 进入轮询主循环 (默认)
    Run,
    /// 查看被监管进程, 运行中返回 0
    Status,
    /// 停止被监管进程和其他服务实例
    Stop,
    /// 依赖与硬件编码器诊断
    Troubleshoot,
    /// 执行清理流程
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = Arc::new(AppConfig::load(&args.config)?);

    // 初始化日志系统
    logging::init(&config.paths.log_file())?;

    let code = match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            if let Err(e) = commands::run(config).await {
                error!("Relay exited with error: {:#}", e);
                return Err(e);
            }
            ExitCode::SUCCESS
        }
        Command::Status => exit_code(commands::status(&config)),
        Command::Stop => {
            commands::stop(&config).await?;
            ExitCode::SUCCESS
        }
        Command::Troubleshoot => exit_code(commands::troubleshoot(&config).await),
        Command::Clean => {
            commands::clean(config).await?;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
