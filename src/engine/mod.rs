// ── Lexfield Engine ─────────────────────────────────────────────────────────
//
// Layering (lower never imports higher):
//   tokenizer → ledger → presence / themes / router → generator
//   recall / quality / loops / trauma / episodes → store → field → blocking
//
// `field` is the only module that holds locks or touches a store; the rest
// are pure functions over borrowed state.

pub mod blocking;
pub mod episodes;
pub mod field;
pub mod generator;
pub mod ledger;
pub mod loops;
pub mod presence;
pub mod quality;
pub mod recall;
pub mod router;
pub mod store;
pub mod themes;
pub mod tokenizer;
pub mod trauma;
