//! 日志系统配置
//!
//! 控制台输出 + 可选的按天滚动文件持久化

use crate::config::LogConfig;
use std::fs;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if config.enabled {
        if let Err(e) = fs::create_dir_all(&config.log_dir) {
            eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
            // 回退到只使用控制台输出
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            return LogGuard { _file_guard: None };
        }

        // 文件名格式: chunkflow-rust.YYYY-MM-DD
        let file_appender =
            tracing_appender::rolling::daily(&config.log_dir, "chunkflow-rust");
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

        // 文件输出层（不带 ANSI 颜色）
        let file_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
            .with_ansi(false)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!(
            "日志系统初始化完成: 目录={:?}, 级别={}",
            config.log_dir, config.level
        );

        LogGuard {
            _file_guard: Some(file_guard),
        }
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        info!("日志系统初始化完成（仅控制台输出）");

        LogGuard { _file_guard: None }
    }
}
