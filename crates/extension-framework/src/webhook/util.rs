//! Helpers for editing workload specs in ensurers.
use k8s_openapi::api::core::v1::Container;

/// Returns the container called `name`, if any.
pub fn container_with_name_mut<'a>(
    containers: &'a mut [Container],
    name: &str,
) -> Option<&'a mut Container> {
    containers
        .iter_mut()
        .find(|container| container.name == name)
}

/// Makes sure `values` contains `<prefix><value>`.
///
/// The first element starting with `prefix` is replaced, if there is none the element is
/// appended. The order of all other elements is preserved.
pub fn ensure_string_with_prefix(values: &mut Vec<String>, prefix: &str, value: &str) {
    let entry = format!("{prefix}{value}");
    match values.iter_mut().find(|existing| existing.starts_with(prefix)) {
        Some(existing) => *existing = entry,
        None => values.push(entry),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[], &["--advertise-address=1.2.3.4"])]
    #[case(
        &["kube-apiserver", "--advertise-address=10.0.0.1", "--secure-port=443"],
        &["kube-apiserver", "--advertise-address=1.2.3.4", "--secure-port=443"]
    )]
    #[case(
        &["kube-apiserver", "--secure-port=443"],
        &["kube-apiserver", "--secure-port=443", "--advertise-address=1.2.3.4"]
    )]
    fn prefixed_value_is_replaced_or_appended(#[case] input: &[&str], #[case] expected: &[&str]) {
        let mut values: Vec<String> = input.iter().map(ToString::to_string).collect();
        ensure_string_with_prefix(&mut values, "--advertise-address=", "1.2.3.4");
        assert_eq!(values, expected);
    }

    #[test]
    fn container_is_found_by_name() {
        let mut containers = vec![
            Container {
                name: "sidecar".to_owned(),
                ..Container::default()
            },
            Container {
                name: "kube-apiserver".to_owned(),
                ..Container::default()
            },
        ];

        let container = container_with_name_mut(&mut containers, "kube-apiserver")
            .expect("container must be found");
        container.command = Some(vec!["kube-apiserver".to_owned()]);

        assert_eq!(containers[1].command.as_deref(), Some(&["kube-apiserver".to_owned()][..]));
        assert!(container_with_name_mut(&mut containers, "etcd").is_none());
    }
}
