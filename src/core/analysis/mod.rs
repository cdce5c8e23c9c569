//! Static inspection of learner source code that never executes it.

pub mod constructs;
pub mod lexer;
pub mod policy;
