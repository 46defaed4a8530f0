// Instance-scoped logging macros. The context argument is anything exposing
// `instance_id()` and `machine_name()`, normally an `ActionContext`.

#[macro_export]
macro_rules! workflow_info {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::info!(
            target: "flowhost::workflow",
            instance_id = %$ctx.instance_id(),
            state_machine = %$ctx.machine_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! workflow_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::warn!(
            target: "flowhost::workflow",
            instance_id = %$ctx.instance_id(),
            state_machine = %$ctx.machine_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! workflow_error {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::error!(
            target: "flowhost::workflow",
            instance_id = %$ctx.instance_id(),
            state_machine = %$ctx.machine_name(),
            $($arg)+
        );
    }};
}
