use geocopilot_types::{Capabilities, CapabilityReport, ErrorKind, Operation};

use crate::datasource::DataSource;

/// Checks one operation against one source for one request.
///
/// Reports are derived fresh on every call and carry the request id they were
/// produced for. Check order: source handle, connector mode, capability flags,
/// reference systems.
pub fn validate(
    request_id: &str,
    source: Option<&dyn DataSource>,
    operation: &Operation,
) -> CapabilityReport {
    let mut report = CapabilityReport {
        request_id: request_id.to_string(),
        source_id: None,
        operation: operation.clone(),
        is_valid: false,
        supported_operations: Capabilities::empty(),
        reason_if_invalid: None,
        detail: String::new(),
    };

    let Some(source) = source else {
        return reject(report, ErrorKind::InvalidSource, "no data source handle");
    };
    report.source_id = Some(source.id().to_string());
    if !source.is_valid() {
        let detail = format!("source `{}` failed its validity check", source.id());
        return reject(report, ErrorKind::InvalidSource, detail);
    }
    report.is_valid = true;

    let connector = source.connector();
    if connector.read_only {
        // read-only connectors expose no mutations whatever their flags say
        if operation.is_mutation() {
            let detail = format!(
                "`{}` is served by read-only connector `{}`; {} is not available",
                source.id(),
                connector.provider,
                operation.name()
            );
            return reject(report, ErrorKind::UnsupportedOperation, detail);
        }
    } else {
        report.supported_operations = source.capabilities();
    }

    if let Some(required) = operation.required_capability() {
        if !report.supported_operations.contains(required) {
            let detail = format!(
                "provider `{}` of `{}` does not support {}",
                connector.provider,
                source.id(),
                operation.name()
            );
            return reject(report, ErrorKind::UnsupportedOperation, detail);
        }
    }

    if operation.bears_reference_system() {
        match source.reference_system() {
            Some(rs) if rs.is_valid() => {}
            Some(rs) => {
                let detail = format!("`{}` has invalid reference system `{rs}`", source.id());
                return reject(report, ErrorKind::InvalidReferenceSystem, detail);
            }
            None => {
                let detail = format!("`{}` has no reference system", source.id());
                return reject(report, ErrorKind::InvalidReferenceSystem, detail);
            }
        }
        if let Some(target) = operation.target_reference_system() {
            if !target.is_valid() {
                let detail = format!("target reference system `{target}` is invalid");
                return reject(report, ErrorKind::InvalidReferenceSystem, detail);
            }
        }
    }

    report
}

fn reject(
    mut report: CapabilityReport,
    kind: ErrorKind,
    detail: impl Into<String>,
) -> CapabilityReport {
    report.reason_if_invalid = Some(kind);
    report.detail = detail.into();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{Field, FieldKind, MemoryLayer};
    use geocopilot_types::{Capability, ReferenceSystem};

    fn layer() -> MemoryLayer {
        MemoryLayer::new("parcels", vec![Field::new("owner", FieldKind::Text)])
    }

    #[test]
    fn missing_handle_is_invalid_source() {
        let report = validate("req-1", None, &Operation::Read);
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::InvalidSource));
        assert!(!report.is_valid);
        assert_eq!(report.request_id, "req-1");
    }

    #[test]
    fn failing_self_check_is_invalid_source() {
        let source = layer().invalid();
        let report = validate("req-1", Some(&source), &Operation::Read);
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::InvalidSource));
        assert_eq!(report.source_id.as_deref(), Some("parcels"));
    }

    #[test]
    fn read_only_connector_rejects_every_mutation_as_unsupported() {
        let source = layer().with_connector("live-feed", true);
        for capability in Capability::ALL {
            let report = validate("req-1", Some(&source), &Operation::from(capability));
            assert_eq!(report.reason_if_invalid, Some(ErrorKind::UnsupportedOperation));
            assert!(report.is_valid);
            assert!(report.supported_operations.is_empty());
        }
        let read = validate("req-1", Some(&source), &Operation::Read);
        assert!(read.is_allowed());
    }

    #[test]
    fn missing_capability_flag_is_unsupported() {
        let source = layer().with_capabilities(
            Capabilities::empty()
                .with(Capability::AddFeatures)
                .with(Capability::ChangeAttributes),
        );
        let report = validate("req-1", Some(&source), &Operation::DeleteFeatures);
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::UnsupportedOperation));
        assert!(report.supported_operations.contains(Capability::AddFeatures));
        assert!(validate("req-1", Some(&source), &Operation::AddFeatures).is_allowed());
    }

    #[test]
    fn reference_systems_are_checked_for_geometry_operations() {
        let broken = layer().with_reference_system(Some(ReferenceSystem::new("EPSG:abc")));
        let report = validate("req-1", Some(&broken), &Operation::ChangeGeometries);
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::InvalidReferenceSystem));
        assert!(validate("req-1", Some(&broken), &Operation::AddFeatures).is_allowed());

        let missing = layer().with_reference_system(None);
        let report = validate(
            "req-1",
            Some(&missing),
            &Operation::Reproject {
                target: ReferenceSystem::epsg(3857),
            },
        );
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::InvalidReferenceSystem));

        let source = layer();
        let bad_target = Operation::Reproject {
            target: ReferenceSystem::new("mercator"),
        };
        let report = validate("req-1", Some(&source), &bad_target);
        assert_eq!(report.reason_if_invalid, Some(ErrorKind::InvalidReferenceSystem));
    }

    #[test]
    fn reports_are_bound_to_their_request() {
        let source = layer();
        let first = validate("req-1", Some(&source), &Operation::AddFeatures);
        let second = validate("req-2", Some(&source), &Operation::AddFeatures);
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(first.supported_operations, second.supported_operations);
    }
}
