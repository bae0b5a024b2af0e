pub mod emit;
pub mod forward;
pub mod io;
pub mod matrices;
pub mod model;
pub mod oracle;
pub mod parsimony;
pub mod progress;
pub mod seq;
pub mod states;
pub mod thread;
pub mod traceback;
pub mod trans;
pub mod tree;
pub mod utils;

pub use model::ArgModel;
pub use seq::{Base, Sequences};
pub use states::{State, ThreadMode};
pub use tree::{LocalTree, LocalTrees};
