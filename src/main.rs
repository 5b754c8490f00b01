use axum::Router;
use chunkflow_rust::{config::AppConfig, logging, server, AppState};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 先加载配置，失败时使用默认配置
    let config = AppConfig::load_or_default("config/app.toml").await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Chunkflow Rust 启动中...");

    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 创建应用状态（打开数据目录并恢复既有会话）
    let app_state = AppState::new(config).await?;
    info!("应用状态初始化完成");

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 构建完整应用
    let app: Router = server::build_router(app_state).layer(middleware);

    // 启动服务器
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1/upload", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    // 监听关闭信号，支持优雅关闭
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("应用已安全退出");
    Ok(())
}
