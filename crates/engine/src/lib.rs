//! crossrun engine
//!
//! Drives cross-browser test runs on cloud vendors: vendor job APIs,
//! WebDriver script sessions, and the local tunnel processes that let
//! remote browsers reach a developer's machine.

pub mod binary;
pub mod config;
pub mod job;
pub mod monitor;
pub mod platform;
pub mod process;
pub mod script;
pub mod tunnel;
pub mod validate;
pub mod vendor;
pub mod webdriver;

pub use binary::TunnelBinary;
pub use config::{Credentials, EngineConfig};
pub use job::Job;
pub use platform::{Platform, Run};
pub use script::{ScriptFn, ScriptJob};
pub use tunnel::{Manager, Tunnel, TunnelInfo};
pub use validate::{BasicValidator, CapabilityValidator};
pub use vendor::{JobAdapter, SessionAdapter, VendorAdapters};
pub use webdriver::WebDriverSession;
