pub mod toml_loader;

pub use toml_loader::{load_all_unit_plans, load_protocol_registry, load_unit_plan};
