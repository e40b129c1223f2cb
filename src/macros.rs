/// The [`CallSite`](crate::CallSite) of the macro invocation
#[macro_export]
macro_rules! call_site {
    () => {
        $crate::CallSite::new(::core::file!(), ::core::line!())
    };
}

/// Evaluate `$value` (a freshly built `Box<T>`, `Vec<T>`, ...) and attribute
/// the allocation behind it to `T` at this call site. Evaluates to the value.
///
/// ```no_run
/// use memtrace::{attribute, Tracker};
///
/// #[global_allocator]
/// static GLOBAL: Tracker = Tracker::new();
///
/// struct Widget([u8; 24]);
///
/// fn main() {
///     let widget = attribute!(GLOBAL, Box::new(Widget([0; 24])));
///     # drop(widget);
/// }
/// ```
///
/// The size of the value is passed along as the size hint, so for containers
/// with spare capacity only the fast path can succeed.
#[macro_export]
macro_rules! attribute {
    ($tracker:expr, $value:expr $(,)?) => {{
        let value = $value;
        $tracker.attribute_value(&value, $crate::call_site!());
        value
    }};
}

/// [`Tracker::allocate()`](crate::Tracker::allocate) with the call site of
/// the macro invocation
#[macro_export]
macro_rules! allocate {
    ($tracker:expr, $size:expr, $kind:expr, $policy:expr $(,)?) => {
        $tracker.allocate($size, $kind, $policy, ::core::option::Option::Some($crate::call_site!()))
    };
}
