//! Orchestration services and the state shared by every handler.

pub mod key_lock;
pub mod permission_resolver;
pub mod transfer_service;
pub mod upload_service;

use crate::backends::Backends;
use permission_resolver::PermissionResolver;
use transfer_service::{TransferService, TransferSettings};
use upload_service::UploadService;

#[derive(Clone)]
pub struct GatewayState {
    pub uploads: UploadService,
    pub transfers: TransferService,
}

impl GatewayState {
    pub fn new(
        backends: Backends,
        max_permission_depth: usize,
        transfer: TransferSettings,
    ) -> Self {
        let resolver = PermissionResolver::new(backends.clone(), max_permission_depth);
        Self {
            uploads: UploadService::new(backends.clone(), resolver.clone()),
            transfers: TransferService::new(backends, resolver, transfer),
        }
    }
}
