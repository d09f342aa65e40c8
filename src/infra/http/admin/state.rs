use std::sync::Arc;

use crate::cache::{CacheAdmin, InvalidationCoordinator};
use crate::infra::content::ContentStore;

#[derive(Clone)]
pub struct AdminState {
    pub cache: CacheAdmin,
    pub coordinator: Arc<InvalidationCoordinator>,
    pub content: Arc<ContentStore>,
}
