// ── Lexfield Atoms Layer ───────────────────────────────────────────────────
// Pure constants, data types, errors and capability traits. The only I/O
// is `FieldConfig::load` reading its own TOML file.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/.

pub mod constants;
pub mod error;
pub mod field_types;
pub mod traits;
