// Reports a programmer error. Always logged; panics in debug builds while
// assertions are enabled (see `config::set_assertions_enabled`).
macro_rules! dispatch_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let message = format!($($arg)+);
            tracing::error!("assertion failed: {}", message);
            if cfg!(debug_assertions) && $crate::config::assertions_enabled() {
                panic!("{}", message);
            }
        }
    };
}
