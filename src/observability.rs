//! 可观测性
//!
//! 交互路径上的降级（嵌入超时、flush 失败重试）只反映在日志里，
//! 宿主进程启动时调用一次 init。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}
