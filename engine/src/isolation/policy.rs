//! Capability-escalation policy
//!
//! The isolation variant a plugin gets is a pure function of the permission
//! kinds it was granted. Variants are strictly ordered
//! `minimal < compute < dom`, and a plugin never gets a stronger variant than
//! its permissions require.

use sdk::manifest::{IsolationVariant, PermissionKind};

/// Weakest variant that covers every granted permission kind
///
/// - `ui` needs a DOM-capable variant
/// - `network` or `storage` need a compute-capable, UI-less variant
/// - anything else runs with no ambient I/O
pub fn select_variant(granted: &[PermissionKind]) -> IsolationVariant {
    granted
        .iter()
        .map(|kind| required_for(*kind))
        .max()
        .unwrap_or(IsolationVariant::Minimal)
}

fn required_for(kind: PermissionKind) -> IsolationVariant {
    match kind {
        PermissionKind::Ui => IsolationVariant::Dom,
        PermissionKind::Network | PermissionKind::Storage => IsolationVariant::Compute,
        PermissionKind::Filesystem | PermissionKind::Api | PermissionKind::System => {
            IsolationVariant::Minimal
        }
    }
}
