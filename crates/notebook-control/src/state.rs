use std::sync::Arc;

use crate::{controller::LifecycleController, identity::IdentityResolver};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<LifecycleController>,
    pub identity: Arc<dyn IdentityResolver>,
}
