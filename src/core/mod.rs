pub mod agent;
pub mod context;
pub mod cortex;
pub mod decision;
pub mod evaluator;
pub mod r#loop;
pub mod parser;
pub mod state;
