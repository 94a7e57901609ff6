use crate::models::unit::UnitPlan;
use crate::services::protocol_registry::ProtocolRegistry;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 加载出题协议文件
pub async fn load_protocol_registry(path: &Path) -> Result<ProtocolRegistry> {
    ProtocolRegistry::load(path)
        .await
        .with_context(|| format!("无法加载协议文件: {}", path.display()))
}

/// 从 TOML 文件加载单元计划
pub async fn load_unit_plan(toml_file_path: &Path) -> Result<UnitPlan> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut plan: UnitPlan = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    // 设置文件路径
    plan.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(plan)
}

/// 从文件夹中加载所有单元计划（按单元 id 排序）
///
/// 单个文件解析失败只记录警告
pub async fn load_all_unit_plans(folder_path: &str) -> Result<Vec<UnitPlan>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut plans = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            tracing::info!(
                "正在加载: {}",
                path.file_name().unwrap_or_default().to_string_lossy()
            );

            match load_unit_plan(&path).await {
                Ok(plan) => {
                    tracing::info!(
                        "成功加载单元 {} ({} 道题, {} 份材料)",
                        plan.unit.id,
                        plan.unit.target_count,
                        plan.materials.len()
                    );
                    plans.push(plan);
                }
                Err(e) => {
                    tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
                }
            }
        }
    }

    plans.sort_by(|a, b| a.unit.id.cmp(&b.unit.id));
    Ok(plans)
}
