use std::collections::BTreeMap;

use crate::CONTROLLER_NAME;

/// Label naming the load test a unit belongs to.
pub const LOAD_TEST_LABEL: &str = "stampede.io/load-test";
/// Label naming the role of a unit, either `master` or `worker`.
pub const ROLE_LABEL: &str = "stampede.io/role";
/// Label holding the index of a worker unit.
pub const WORKER_INDEX_LABEL: &str = "stampede.io/worker-index";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "app.kubernetes.io/managed-by=stampede";

/// Labels that indicate the resource is managed by the stampede proxy.
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![(
        MANAGED_BY_LABEL.to_owned(),
        CONTROLLER_NAME.to_owned(),
    )])
}

/// Create managed labels and extend them with the given labels.
pub fn managed_labels_extend(labels: BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut managed = managed_labels();
    managed.extend(labels);
    managed
}

/// Labels shared by every unit of a load test.
pub fn load_test_labels(id: &str) -> BTreeMap<String, String> {
    managed_labels_extend(BTreeMap::from_iter(vec![(
        LOAD_TEST_LABEL.to_owned(),
        id.to_owned(),
    )]))
}

/// Selector matching every unit of a load test.
pub fn load_test_selector(id: &str) -> String {
    format!("{MANAGED_BY_LABEL_SELECTOR},{LOAD_TEST_LABEL}={id}")
}

/// Reports whether a string can be used as a label key or value.
pub fn is_valid_label_value(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value.starts_with(|c: char| c.is_ascii_alphanumeric())
        && value.ends_with(|c: char| c.is_ascii_alphanumeric())
}
