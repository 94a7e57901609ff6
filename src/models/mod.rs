pub mod loaders;
pub mod protocol;
pub mod question;
pub mod run;
pub mod unit;
pub mod usage;
pub mod validation;

pub use loaders::{load_all_unit_plans, load_protocol_registry, load_unit_plan};
pub use protocol::{Archetype, CognitiveLoad, Difficulty, FidelityTag, Protocol, StructuralForm};
pub use question::{AcceptedQuestion, RawQuestion};
pub use run::{GenerationReport, GenerationRun, UnitOutcome};
pub use unit::{DocumentHandle, GenerationUnit, ReferenceMaterial, UnitPlan, UnitScope, UnitStatus};
pub use usage::{CostBreakdown, PricingMode, TokenUsage, UsageRecord};
pub use validation::{Issue, ReasonCode, ValidationResult};
