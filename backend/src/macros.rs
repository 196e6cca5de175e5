//! Crate-internal macros.

/// Implement `Debug` for a struct whose `hidden` fields must never be
/// printed. Hidden fields render as `"[REDACTED]"`, `shown` fields use
/// their own `Debug` output.
///
/// ```ignore
/// redacted_debug!(Config {
///     hidden: [database_url],
///     shown: [bind_address, sqs_region],
/// });
/// ```
macro_rules! redacted_debug {
    ($name:ident {
        hidden: [$($hidden:ident),* $(,)?],
        shown: [$($shown:ident),* $(,)?] $(,)?
    }) => {
        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(stringify!($name))
                    $(.field(stringify!($hidden), &"[REDACTED]"))*
                    $(.field(stringify!($shown), &self.$shown))*
                    .finish()
            }
        }
    };
}
