use anyhow::{Context, Result};
/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::run::GenerationRun;

/// 初始化 tracing 订阅器
///
/// 优先使用 `RUST_LOG`；未设置时默认 `info`，`verbose` 为 true 时为 `debug`。
/// 重复调用不会报错
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n出题运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)
        .with_context(|| format!("无法写入日志文件: {}", log_file_path))?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 协议驱动出题模式");
    info!("📊 最大并发单元数: {}", config.max_concurrent_units);
    info!("🤖 模型: {}", config.llm_model_name);
    info!("📜 协议文件: {}", config.protocol_file);
    info!("{}", "=".repeat(60));
}

/// 记录单元加载信息
///
/// # 参数
/// - `total`: 单元总数
/// - `max_concurrent`: 最大并发数
pub fn log_units_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个生成单元", total);
    info!("📋 最多同时处理 {} 个单元", max_concurrent);
    info!("💡 单元失败不影响其他单元\n");
}

/// 打印最终统计信息
pub fn print_final_stats(run: &GenerationRun, log_file_path: &str) {
    let total = run.units_completed + run.units_failed;
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", run.units_completed, total);
    info!("❌ 失败: {}", run.units_failed);
    info!("📝 生成题目: {}", run.total_generated);
    info!(
        "💰 费用: ${:.4} (≈ {:.2})",
        run.cost.total, run.cost.local_currency_total
    );
    for timing in &run.unit_timings {
        info!(
            "   {} → {} ({:.1}s)",
            timing.unit_id,
            timing.status.map(|s| s.as_str()).unwrap_or("unknown"),
            timing.elapsed_ms as f64 / 1000.0
        );
    }
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("细胞是生命的基本单位", 4), "细胞是生...");
    }

    #[test]
    fn test_init_is_idempotent() {
        init(false);
        init(true);
    }

    #[test]
    fn test_init_log_file_writes_header() {
        let path = std::env::temp_dir().join(format!("qf-log-{}.txt", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        init_log_file(&path_str).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("出题运行日志"));
        let _ = fs::remove_file(&path);
    }
}
