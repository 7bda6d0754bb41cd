//! # pretrain-core — Model
//!
//! The trainer only ever talks to a model through [`CausalLm`]; [`TinyLm`]
//! is the reference implementation built on `candle-core`/`candle-nn`:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linear`] | `CastLinear` (f32 master weights, autocast matmul) |
//! | [`attention`] | `CausalSelfAttention` (GQA + RoPE), `PosCis` rotary buffer |
//! | [`ffn`] | SwiGLU `FeedForward`, `MoeFeedForward` with load-balancing loss |
//! | [`model`] | `TinyLm`, `CausalLm`, `LmOutput`, `parameter_count` |

pub mod attention;
pub mod ffn;
pub mod linear;
pub mod model;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attention::{PosCis, POS_CIS};
pub use model::{parameter_count, CausalLm, LmOutput, TinyLm};
