pub mod builders;
pub mod engine;
pub mod server;

pub use builders::{LeadBuilder, UserBuilder};
pub use engine::{TestEngine, CRM_POLICY, PIPELINE_POLICY};
pub use server::TestServer;
