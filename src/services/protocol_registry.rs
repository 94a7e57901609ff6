//! 协议注册表 - 业务能力层
//!
//! 启动时从声明式 TOML 配置构建一次，之后只读，并发读取无需加锁。
//! 查找只支持 (考试, 科目) 精确匹配。

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AppError, ConfigError, FileError};
use crate::models::protocol::{
    Bounds, CognitiveLoad, CognitiveLoadRules, Difficulty, DifficultyPresets, Distribution,
    FidelityTag, Pairing, PercentRange, Prohibitions, Protocol, StructuralForm, Archetype,
};

/// 题干中引用来源的措辞（始终启用）
const DEFAULT_META_REFERENCE_PATTERNS: &[&str] = &[
    r"(?i)\baccording to (the )?(ncert|notes?|text ?books?|texts?|passages?|(study |provided |given |reference )?materials?|documents?|chapters?|sources?|pdfs?)\b",
    r"(?i)\bas (per|mentioned in|stated in|given in|described in|discussed in) the (provided |given |study |reference )?(materials?|notes?|text ?books?|texts?|passages?|documents?|chapters?|sources?|pdfs?)\b",
    r"(?i)\bthe (study |provided |given |reference )?(materials?|notes|documents?|passages?|texts?) (states?|says|mentions?|describes?|explains?)\b",
    r"(?i)\b(in|from) the (provided|given|attached|uploaded|reference) (materials?|notes?|texts?|documents?|passages?|pdfs?)\b",
];

fn default_banned_options() -> Vec<String> {
    ["None of the above", "All of the above", "None of these", "All of these"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_banned_stem_phrases() -> Vec<String> {
    ["always", "never"].iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_high() -> usize {
    2
}

/// 内置难度预设（协议未声明时使用）
fn builtin_difficulty_presets() -> DifficultyPresets {
    let preset = |easy: (f64, f64), medium: (f64, f64), hard: (f64, f64)| {
        let mut mix = Distribution::new();
        mix.insert(Difficulty::Easy, PercentRange::new(easy.0, easy.1));
        mix.insert(Difficulty::Medium, PercentRange::new(medium.0, medium.1));
        mix.insert(Difficulty::Hard, PercentRange::new(hard.0, hard.1));
        mix
    };
    let mut presets = BTreeMap::new();
    presets.insert("easy".to_string(), preset((50.0, 60.0), (30.0, 40.0), (5.0, 15.0)));
    presets.insert("balanced".to_string(), preset((25.0, 35.0), (40.0, 50.0), (20.0, 30.0)));
    presets.insert("hard".to_string(), preset((5.0, 15.0), (35.0, 45.0), (45.0, 55.0)));
    presets
}

// ========== 配置文件格式 ==========

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    protocol: Vec<ProtocolSpec>,
}

#[derive(Debug, Deserialize)]
struct CognitiveLoadSpec {
    word_bounds: Bounds,
    decision_bounds: Bounds,
    density_mix: Distribution<CognitiveLoad>,
    #[serde(default = "default_max_consecutive_high")]
    max_consecutive_high: usize,
}

#[derive(Debug, Deserialize)]
struct ProhibitionSpec {
    #[serde(default = "default_banned_options")]
    banned_options: Vec<String>,
    #[serde(default = "default_banned_stem_phrases")]
    banned_stem_phrases: Vec<String>,
    #[serde(default)]
    option_patterns: Vec<String>,
    #[serde(default)]
    stem_patterns: Vec<String>,
    #[serde(default)]
    meta_reference_patterns: Vec<String>,
    #[serde(default = "default_true")]
    forbid_double_negatives: bool,
    #[serde(default = "default_true")]
    forbid_subset_options: bool,
}

impl Default for ProhibitionSpec {
    fn default() -> Self {
        Self {
            banned_options: default_banned_options(),
            banned_stem_phrases: default_banned_stem_phrases(),
            option_patterns: Vec::new(),
            stem_patterns: Vec::new(),
            meta_reference_patterns: Vec::new(),
            forbid_double_negatives: true,
            forbid_subset_options: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProtocolSpec {
    id: String,
    exam: String,
    subject: String,
    archetypes: Distribution<Archetype>,
    structural_forms: Distribution<StructuralForm>,
    cognitive_load: CognitiveLoadSpec,
    #[serde(default)]
    fidelity: Distribution<FidelityTag>,
    #[serde(default)]
    pairings: Vec<Pairing>,
    #[serde(default)]
    difficulty_presets: DifficultyPresets,
    #[serde(default)]
    prohibitions: ProhibitionSpec,
}

// ========== 校验与编译 ==========

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_all(patterns: &[String]) -> Result<Vec<(String, Regex)>, ConfigError> {
    patterns
        .iter()
        .map(|p| compile(p).map(|re| (p.clone(), re)))
        .collect()
}

/// 检查分布：每个区间 0 ≤ min ≤ max ≤ 100，且 Σmin ≤ 100 ≤ Σmax
///
/// 满足后，对任意 N ≥ 1 都存在总和为 N 的整数分配
fn check_distribution<K>(
    protocol: &str,
    dimension: &str,
    dist: &Distribution<K>,
) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidDistribution {
        protocol: protocol.to_string(),
        dimension: dimension.to_string(),
        reason,
    };

    if dist.is_empty() {
        return Err(invalid("分布为空".to_string()));
    }

    let mut min_sum = 0.0;
    let mut max_sum = 0.0;
    for range in dist.values() {
        if !(range.min >= 0.0 && range.min <= range.max && range.max <= 100.0) {
            return Err(invalid(format!("区间 {} 不合法", range)));
        }
        min_sum += range.min;
        max_sum += range.max;
    }

    if min_sum > 100.0 + f64::EPSILON || max_sum < 100.0 - f64::EPSILON {
        return Err(invalid(format!(
            "区间无法凑成 100% (下限之和 {}, 上限之和 {})",
            min_sum, max_sum
        )));
    }

    Ok(())
}

impl ProtocolSpec {
    fn build(self) -> Result<Protocol, ConfigError> {
        let id = self.id.clone();
        check_distribution(&id, "archetypes", &self.archetypes)?;
        check_distribution(&id, "structural_forms", &self.structural_forms)?;
        check_distribution(&id, "cognitive_load.density_mix", &self.cognitive_load.density_mix)?;
        if !self.fidelity.is_empty() {
            check_distribution(&id, "fidelity", &self.fidelity)?;
        }

        let mut difficulty_presets = builtin_difficulty_presets();
        for (name, mix) in self.difficulty_presets {
            check_distribution(&id, &format!("difficulty_presets.{}", name), &mix)?;
            difficulty_presets.insert(name, mix);
        }

        let spec = self.prohibitions;
        let banned_stem_phrases = spec
            .banned_stem_phrases
            .iter()
            .map(|phrase| {
                compile(&format!(r"(?i)\b{}\b", regex::escape(phrase.trim())))
                    .map(|re| (phrase.clone(), re))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut meta_patterns: Vec<String> = DEFAULT_META_REFERENCE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        meta_patterns.extend(spec.meta_reference_patterns);

        let prohibitions = Prohibitions {
            banned_options: spec.banned_options,
            banned_stem_phrases,
            option_patterns: compile_all(&spec.option_patterns)?,
            stem_patterns: compile_all(&spec.stem_patterns)?,
            meta_reference_patterns: compile_all(&meta_patterns)?,
            forbid_double_negatives: spec.forbid_double_negatives,
            forbid_subset_options: spec.forbid_subset_options,
        };

        Ok(Protocol {
            id: self.id,
            exam: self.exam,
            subject: self.subject,
            archetypes: self.archetypes,
            structural_forms: self.structural_forms,
            cognitive_load: CognitiveLoadRules {
                word_bounds: self.cognitive_load.word_bounds,
                decision_bounds: self.cognitive_load.decision_bounds,
                density_mix: self.cognitive_load.density_mix,
                max_consecutive_high: self.cognitive_load.max_consecutive_high,
            },
            fidelity: self.fidelity,
            pairings: self.pairings,
            difficulty_presets,
            prohibitions,
        })
    }
}

// ========== 注册表 ==========

/// 协议注册表
///
/// 克隆代价很低（内部共享 `Arc`）
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    by_key: Arc<HashMap<(String, String), Arc<Protocol>>>,
    by_id: Arc<HashMap<String, Arc<Protocol>>>,
}

impl ProtocolRegistry {
    /// 从已构建的协议列表创建
    pub fn from_protocols(protocols: Vec<Protocol>) -> Result<Self, ConfigError> {
        let mut by_key = HashMap::new();
        let mut by_id = HashMap::new();

        for protocol in protocols {
            let protocol = Arc::new(protocol);
            if by_id.insert(protocol.id.clone(), protocol.clone()).is_some() {
                return Err(ConfigError::DuplicateProtocol {
                    key: protocol.id.clone(),
                });
            }
            if by_key.insert(protocol.key(), protocol.clone()).is_some() {
                return Err(ConfigError::DuplicateProtocol {
                    key: format!("{} / {}", protocol.exam, protocol.subject),
                });
            }
            debug!("已注册协议: {} ({} / {})", protocol.id, protocol.exam, protocol.subject);
        }

        Ok(Self {
            by_key: Arc::new(by_key),
            by_id: Arc::new(by_id),
        })
    }

    /// 解析 TOML 配置内容
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: RegistryFile = toml::from_str(content)?;
        let protocols = file
            .protocol
            .into_iter()
            .map(ProtocolSpec::build)
            .collect::<Result<Vec<_>, _>>()?;
        let registry = Self::from_protocols(protocols)?;
        info!("✓ 已加载 {} 个出题协议", registry.len());
        Ok(registry)
    }

    /// 读取并解析协议文件
    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FileError::ReadFailed {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::from_toml_str(&content)?)
    }

    /// 按 (考试, 科目) 精确查找
    pub fn lookup(&self, exam: &str, subject: &str) -> Result<Arc<Protocol>, ConfigError> {
        self.by_key
            .get(&(exam.to_string(), subject.to_string()))
            .cloned()
            .ok_or_else(|| ConfigError::ProtocolNotFound {
                exam: exam.to_string(),
                subject: subject.to_string(),
            })
    }

    /// 按协议 ID 查找
    pub fn get(&self, id: &str) -> Result<Arc<Protocol>, ConfigError> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::ProtocolIdNotFound { id: id.to_string() })
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn protocols(&self) -> impl Iterator<Item = &Arc<Protocol>> {
        self.by_id.values()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const SAMPLE_REGISTRY: &str = r#"
[[protocol]]
id = "neet-biology"
exam = "NEET"
subject = "Biology"

[protocol.archetypes]
recall = { min = 25, max = 35 }
application = { min = 20, max = 30 }
integrative = { min = 15, max = 25 }
discriminator = { min = 10, max = 20 }
exception = { min = 5, max = 10 }

[protocol.structural_forms]
standard_mcq = { min = 40, max = 50 }
match_the_following = { min = 5, max = 15 }
assertion_reason = { min = 10, max = 20 }
multi_statement = { min = 15, max = 25 }
negative_phrasing = { min = 0, max = 10 }

[protocol.cognitive_load]
word_bounds = { min = 8, max = 90 }
decision_bounds = { min = 1, max = 4 }
max_consecutive_high = 2

[protocol.cognitive_load.density_mix]
high = { min = 20, max = 30 }
medium = { min = 40, max = 50 }
low = { min = 25, max = 35 }

[protocol.fidelity]
verbatim = { min = 30, max = 40 }
adapted = { min = 40, max = 50 }
paraphrased = { min = 15, max = 25 }

[[protocol.pairings]]
archetype = "integrative"
forms = ["multi_statement", "assertion_reason"]
strength = "mandatory"

[[protocol.pairings]]
archetype = "exception"
forms = ["negative_phrasing"]
strength = "strong"

[protocol.prohibitions]
banned_options = ["None of the above", "All of the above"]
banned_stem_phrases = ["always", "never"]
"#;

    pub fn sample_registry() -> ProtocolRegistry {
        ProtocolRegistry::from_toml_str(SAMPLE_REGISTRY).expect("样例协议应当合法")
    }

    pub fn sample_protocol() -> Arc<Protocol> {
        sample_registry().lookup("NEET", "Biology").expect("样例协议存在")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_lookup_exact_key() {
        let registry = sample_registry();
        let protocol = registry.lookup("NEET", "Biology").unwrap();
        assert_eq!(protocol.id, "neet-biology");
        assert_eq!(protocol.cognitive_load.max_consecutive_high, 2);
        assert_eq!(protocol.archetypes.len(), 5);
        assert!(registry.get("neet-biology").is_ok());
    }

    #[test]
    fn test_lookup_has_no_fuzzy_matching() {
        let registry = sample_registry();
        for (exam, subject) in [("neet", "Biology"), ("NEET", "Bio"), ("NEET", "Biology ")] {
            match registry.lookup(exam, subject) {
                Err(ConfigError::ProtocolNotFound { .. }) => {}
                other => panic!("期望 ProtocolNotFound, 实际 {:?}", other.map(|p| p.id.clone())),
            }
        }
        assert!(matches!(
            registry.get("neet-physics"),
            Err(ConfigError::ProtocolIdNotFound { .. })
        ));
    }

    #[test]
    fn test_defaults_and_builtin_presets() {
        let protocol = sample_protocol();
        assert!(protocol.difficulty_presets.contains_key("balanced"));
        assert!(protocol.difficulty_presets.contains_key("hard"));
        assert_eq!(
            protocol.prohibitions.meta_reference_patterns.len(),
            DEFAULT_META_REFERENCE_PATTERNS.len()
        );
        assert!(protocol.prohibitions.forbid_double_negatives);
        assert_eq!(protocol.prohibitions.banned_stem_phrases.len(), 2);
    }

    #[test]
    fn test_rejects_unreachable_distribution() {
        let broken = SAMPLE_REGISTRY.replace(
            "recall = { min = 25, max = 35 }",
            "recall = { min = 75, max = 85 }",
        );
        match ProtocolRegistry::from_toml_str(&broken) {
            Err(ConfigError::InvalidDistribution { dimension, .. }) => {
                assert_eq!(dimension, "archetypes")
            }
            other => panic!("期望 InvalidDistribution, 实际 {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_rejects_inverted_range() {
        let broken = SAMPLE_REGISTRY.replace(
            "high = { min = 20, max = 30 }",
            "high = { min = 30, max = 20 }",
        );
        assert!(matches!(
            ProtocolRegistry::from_toml_str(&broken),
            Err(ConfigError::InvalidDistribution { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_key() {
        let doubled = format!(
            "{}\n{}",
            SAMPLE_REGISTRY,
            SAMPLE_REGISTRY.replace("id = \"neet-biology\"", "id = \"neet-biology-2\"")
        );
        assert!(matches!(
            ProtocolRegistry::from_toml_str(&doubled),
            Err(ConfigError::DuplicateProtocol { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let broken = SAMPLE_REGISTRY.replace(
            "banned_stem_phrases = [\"always\", \"never\"]",
            "banned_stem_phrases = [\"always\"]\nstem_patterns = [\"(unclosed\"]",
        );
        assert!(matches!(
            ProtocolRegistry::from_toml_str(&broken),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }
}
