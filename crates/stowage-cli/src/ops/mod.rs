pub mod context;
pub mod deploy;
pub mod error;
pub mod pack;
pub mod publish;
pub mod switch;
pub mod target;

pub use context::Context;
pub use deploy::{DeployRequest, DeployResult, DeploySubject, deploy};
pub use error::{OpError, exit};
pub use pack::{PackRequest, PackResult, pack};
pub use publish::{ComponentOutcome, ComponentStatus, PublishRequest, PublishResult, publish};
pub use switch::{
    list_deployed_versions, rollback_release, status, switch_version, verify_deployment,
};
pub use target::{DeployTarget, VerifyReport};
