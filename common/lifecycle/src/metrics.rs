pub(crate) const METRIC_STARTUP_RESULT: &str = "app_startup_result_total";
pub(crate) const METRIC_COMPONENT_START_DURATION: &str = "app_component_start_duration_seconds";
pub(crate) const METRIC_REGISTRATION_RESULT: &str = "app_registration_result_total";
pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "app_shutdown_initiated_total";
pub(crate) const METRIC_SHUTDOWN_COMPLETED: &str = "app_shutdown_completed_total";
pub(crate) const METRIC_COMPONENT_STOP_DURATION: &str = "app_component_stop_duration_seconds";
pub(crate) const METRIC_COMPONENT_STOP_RESULT: &str = "app_component_stop_result_total";

pub(crate) fn emit_startup_result(service_name: &str, result: &str) {
    metrics::counter!(
        METRIC_STARTUP_RESULT,
        "service_name" => service_name.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_component_start_duration(
    service_name: &str,
    component: &str,
    result: &str,
    duration_secs: f64,
) {
    metrics::histogram!(
        METRIC_COMPONENT_START_DURATION,
        "service_name" => service_name.to_string(),
        "component" => component.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}

/// `operation` is `register` or `deregister`.
pub(crate) fn emit_registration_result(service_name: &str, operation: &str, result: &str) {
    metrics::counter!(
        METRIC_REGISTRATION_RESULT,
        "service_name" => service_name.to_string(),
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_initiated(service_name: &str, trigger_reason: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "service_name" => service_name.to_string(),
        "trigger_reason" => trigger_reason.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_shutdown_completed(service_name: &str, clean: bool) {
    metrics::counter!(
        METRIC_SHUTDOWN_COMPLETED,
        "service_name" => service_name.to_string(),
        "clean" => clean.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_component_stop_duration(
    service_name: &str,
    component: &str,
    result: &str,
    duration_secs: f64,
) {
    metrics::histogram!(
        METRIC_COMPONENT_STOP_DURATION,
        "service_name" => service_name.to_string(),
        "component" => component.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}

pub(crate) fn emit_component_stop_result(service_name: &str, component: &str, result: &str) {
    metrics::counter!(
        METRIC_COMPONENT_STOP_RESULT,
        "service_name" => service_name.to_string(),
        "component" => component.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}
