//! 参考材料来源 - 基础设施层

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

use crate::models::unit::{GenerationUnit, ReferenceMaterial, UnitPlan};

/// 按单元提供参考材料
#[async_trait]
pub trait MaterialSource: Send + Sync {
    async fn materials_for(&self, unit: &GenerationUnit) -> Result<Vec<ReferenceMaterial>>;
}

/// 直接使用单元计划文件中列出的材料
///
/// 相对路径按计划文件所在目录解析
#[derive(Debug, Default, Clone)]
pub struct PlanMaterialSource {
    by_unit: HashMap<String, Vec<ReferenceMaterial>>,
}

fn resolve_ref(file_ref: &str, plan_path: Option<&str>) -> String {
    let is_remote = file_ref.starts_with("http://") || file_ref.starts_with("https://");
    if is_remote || Path::new(file_ref).is_absolute() {
        return file_ref.to_string();
    }
    match plan_path.and_then(|p| Path::new(p).parent()) {
        Some(dir) => dir.join(file_ref).to_string_lossy().to_string(),
        None => file_ref.to_string(),
    }
}

impl PlanMaterialSource {
    pub fn from_plans(plans: &[UnitPlan]) -> Self {
        let by_unit = plans
            .iter()
            .map(|plan| {
                let materials = plan
                    .materials
                    .iter()
                    .map(|m| ReferenceMaterial {
                        title: m.title.clone(),
                        file_ref: resolve_ref(&m.file_ref, plan.file_path.as_deref()),
                    })
                    .collect();
                (plan.unit.id.clone(), materials)
            })
            .collect();
        Self { by_unit }
    }
}

#[async_trait]
impl MaterialSource for PlanMaterialSource {
    async fn materials_for(&self, unit: &GenerationUnit) -> Result<Vec<ReferenceMaterial>> {
        self.by_unit
            .get(&unit.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("单元 {} 没有材料清单", unit.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::fixtures::unit;

    #[tokio::test]
    async fn test_relative_refs_resolve_against_plan_file() {
        let plan = UnitPlan {
            unit: unit("u1", 10),
            materials: vec![
                ReferenceMaterial {
                    title: "Notes".to_string(),
                    file_ref: "materials/cell.txt".to_string(),
                },
                ReferenceMaterial {
                    title: "Remote".to_string(),
                    file_ref: "https://example.org/cell.txt".to_string(),
                },
            ],
            file_path: Some("/data/units/u1.toml".to_string()),
        };
        let source = PlanMaterialSource::from_plans(&[plan]);
        let materials = source.materials_for(&unit("u1", 10)).await.unwrap();
        assert_eq!(materials[0].file_ref, "/data/units/materials/cell.txt");
        assert_eq!(materials[1].file_ref, "https://example.org/cell.txt");

        assert!(source.materials_for(&unit("u2", 10)).await.is_err());
    }
}
