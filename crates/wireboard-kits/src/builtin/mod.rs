pub mod fetch;
pub mod passthrough;
pub mod template;

use crate::kit::Kit;

pub const CORE_KIT_URL: &str = "wireboard:core";

/// The kit shipped with every harness.
pub fn core_kit() -> Kit {
    Kit::new(CORE_KIT_URL)
        .with_title("Core Kit")
        .with_description("Plumbing and HTTP nodes available to every board")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_tag("builtin")
        .with_handler("passthrough", passthrough::PassthroughHandler)
        .with_handler("promptTemplate", template::PromptTemplateHandler)
        .with_handler("fetch", fetch::FetchHandler)
}
