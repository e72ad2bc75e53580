pub mod config;
pub mod sessions;
pub mod voice;

pub use config::*;
pub use sessions::*;
pub use voice::*;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::ai::testing::FakeConnector;
    use crate::ai::tools::ToolBox;
    use crate::ai::AiSetup;
    use crate::config::{AppConfig, MirrorKind};
    use crate::session::mirror::mirror_for;
    use crate::session::SessionManager;
    use crate::state::{AppState, GatewayMetrics};
    use std::sync::Arc;

    /// State backed by an in-process AI service.
    pub fn test_state(config: AppConfig) -> AppState {
        let manager = SessionManager::new(
            &config.sessions,
            FakeConnector::new(),
            AiSetup::default(),
            Arc::new(ToolBox::new(config.tools.clone())),
            mirror_for(MirrorKind::None),
        );
        AppState::new(
            Arc::new(config),
            Arc::new(manager),
            Arc::new(GatewayMetrics::default()),
        )
    }
}
