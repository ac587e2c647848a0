//! Built-in native functions
//!
//! The functions the token processor binds by name: constant-array element
//! access (one overload per integer element type, matched by return type),
//! the string operator family, and the `length()` method on strings.
//! Hosts register them into a dedicated module before adding their own
//! bindings.

use lemon_core::{BaseValueRepr, FunctionFlags};

use crate::exec::ExecContext;
use crate::module::Module;
use crate::native::{wrap, StackValued, StringRef};

/// Names of the built-in functions. The leading `#` keeps them out of the
/// script-visible namespace; the token processor addresses them by hash.
pub const CONSTANT_ARRAY_ACCESS: &str = "#builtin_constant_array_access";
pub const STRING_OPERATOR_PLUS: &str = "#builtin_string_operator_plus";
pub const STRING_OPERATOR_PLUS_INT64: &str = "#builtin_string_operator_plus_int64";
pub const STRING_OPERATOR_PLUS_INT64_INV: &str = "#builtin_string_operator_plus_int64_inv";
pub const STRING_OPERATOR_LESS: &str = "#builtin_string_operator_less";
pub const STRING_OPERATOR_LESS_OR_EQUAL: &str = "#builtin_string_operator_less_or_equal";
pub const STRING_OPERATOR_GREATER: &str = "#builtin_string_operator_greater";
pub const STRING_OPERATOR_GREATER_OR_EQUAL: &str = "#builtin_string_operator_greater_or_equal";

fn resolve_string(context: &ExecContext<'_>, string: StringRef) -> String {
    match context.strings.get_by_hash(string.hash) {
        Some(stored) => stored.as_str().to_string(),
        None => {
            tracing::warn!(key = string.hash, "unresolved string key");
            String::new()
        }
    }
}

fn store_string(context: &mut ExecContext<'_>, text: &str) -> StringRef {
    StringRef::new(context.strings.add(text))
}

fn add_constant_array_access<T>(module: &mut Module)
where
    T: StackValued + BaseValueRepr + Send + Sync + 'static,
{
    module.add_native_function(
        CONSTANT_ARRAY_ACCESS,
        wrap(|context: &mut ExecContext<'_>, array_id: u32, index: u32| -> T {
            let value = context
                .program
                .constant_array_by_id(array_id)
                .and_then(|array| array.values.get(index as usize).copied())
                .unwrap_or_default();
            value.get::<T>()
        }),
        FunctionFlags::ALLOW_INLINE_EXECUTION,
    );
}

/// Register all built-in functions into the given module.
pub fn register_builtin_functions(module: &mut Module) {
    // Constant-array readers, one per integer element type; the processor
    // picks the overload whose return type matches the element type.
    add_constant_array_access::<u8>(module);
    add_constant_array_access::<u16>(module);
    add_constant_array_access::<u32>(module);
    add_constant_array_access::<u64>(module);
    add_constant_array_access::<i8>(module);
    add_constant_array_access::<i16>(module);
    add_constant_array_access::<i32>(module);
    add_constant_array_access::<i64>(module);

    module.add_native_function(
        STRING_OPERATOR_PLUS,
        wrap(
            |context: &mut ExecContext<'_>, a: StringRef, b: StringRef| -> StringRef {
                let mut combined = resolve_string(context, a);
                combined.push_str(&resolve_string(context, b));
                store_string(context, &combined)
            },
        ),
        FunctionFlags::empty(),
    );

    module.add_native_function(
        STRING_OPERATOR_PLUS_INT64,
        wrap(
            |context: &mut ExecContext<'_>, a: StringRef, b: i64| -> StringRef {
                let combined = format!("{}{}", resolve_string(context, a), b);
                store_string(context, &combined)
            },
        ),
        FunctionFlags::empty(),
    );

    module.add_native_function(
        STRING_OPERATOR_PLUS_INT64_INV,
        wrap(
            |context: &mut ExecContext<'_>, a: i64, b: StringRef| -> StringRef {
                let combined = format!("{}{}", a, resolve_string(context, b));
                store_string(context, &combined)
            },
        ),
        FunctionFlags::empty(),
    );

    module.add_native_function(
        STRING_OPERATOR_LESS,
        wrap(|context: &mut ExecContext<'_>, a: StringRef, b: StringRef| -> bool {
            resolve_string(context, a) < resolve_string(context, b)
        }),
        FunctionFlags::empty(),
    );

    module.add_native_function(
        STRING_OPERATOR_LESS_OR_EQUAL,
        wrap(|context: &mut ExecContext<'_>, a: StringRef, b: StringRef| -> bool {
            resolve_string(context, a) <= resolve_string(context, b)
        }),
        FunctionFlags::empty(),
    );

    module.add_native_function(
        STRING_OPERATOR_GREATER,
        wrap(|context: &mut ExecContext<'_>, a: StringRef, b: StringRef| -> bool {
            resolve_string(context, a) > resolve_string(context, b)
        }),
        FunctionFlags::empty(),
    );

    module.add_native_function(
        STRING_OPERATOR_GREATER_OR_EQUAL,
        wrap(|context: &mut ExecContext<'_>, a: StringRef, b: StringRef| -> bool {
            resolve_string(context, a) >= resolve_string(context, b)
        }),
        FunctionFlags::empty(),
    );

    // `<string-var>.length()`
    module.add_native_method(
        "string",
        "length",
        wrap(|context: &mut ExecContext<'_>, s: StringRef| -> u32 {
            resolve_string(context, s).len() as u32
        }),
        FunctionFlags::empty(),
    );
}
