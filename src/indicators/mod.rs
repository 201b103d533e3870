// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free helpers used by the reference strategy. Every
// public function returns an empty series or `None` so callers are forced to
// handle insufficient-data and numerical-edge-case scenarios.

pub mod atr;
pub mod ema;
