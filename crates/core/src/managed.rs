//! Server-managed fields that must not be sent back on apply.

use crate::Json;

/// Paths as segment lists: annotation keys contain dots, so a dotted string
/// cannot address them.
pub const SERVER_MANAGED: &[&[&str]] = &[
    &["status"],
    &["metadata", "uid"],
    &["metadata", "selfLink"],
    &["metadata", "generation"],
    &["metadata", "resourceVersion"],
    &["metadata", "creationTimestamp"],
    &["metadata", "annotations", "kubectl.kubernetes.io/last-applied-configuration"],
];

/// Remove every server-managed field from `yaml` in place.
pub fn strip_server_fields(yaml: &mut Json) {
    for path in SERVER_MANAGED {
        remove_path(yaml, path);
    }
    #[cfg(feature = "strip-managed-fields")]
    remove_path(yaml, &["metadata", "managedFields"]);
}

fn remove_path(yaml: &mut Json, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = yaml;
    for seg in parents {
        match cur.get_mut(*seg) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(*last);
    }
}
