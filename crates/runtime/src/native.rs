//! Native function binding layer
//!
//! Bridges host callables into the VM ABI: arguments are popped from the
//! value stack in reverse push order, the callable runs, and a non-void
//! result is pushed back. The binding is reflected at registration time so
//! the module can derive the function's parameter types and signature hash
//! from the callable itself.
//!
//! Supported parameter and return types are the integer widths, `bool`,
//! `f32`/`f64`, [`StringRef`] (interned string key), [`ArrayRef`] (array
//! handle), and [`AnyTypeValue`] (value plus data-type ID, two stack cells).

use lemon_core::{AnyBaseValue, DataTypeRef, PredefinedDataTypes};

use crate::exec::ExecContext;

/// Type-erased native callable plus its reflected type information.
pub struct NativeFunctionWrapper {
    pub callable: Box<dyn Fn(&mut ExecContext<'_>) + Send + Sync>,
    pub return_type: DataTypeRef,
    pub parameter_types: Vec<DataTypeRef>,
}

impl std::fmt::Debug for NativeFunctionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionWrapper")
            .field("return_type", &self.return_type.name().as_str())
            .field("parameter_count", &self.parameter_types.len())
            .finish_non_exhaustive()
    }
}

/// The script `string` type at the ABI boundary: only the 64-bit hash key.
/// Resolution goes through the runtime's string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringRef {
    pub hash: u64,
}

impl StringRef {
    pub fn new(hash: u64) -> Self {
        StringRef { hash }
    }
}

/// An array handle: a 32-bit ID (constant-array or array-typed variable).
/// At the ABI level this is a plain u32 cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRef {
    pub id: u32,
}

/// The script `any` type: a value cell plus the data-type ID describing it.
/// Occupies two stack cells (value pushed first, type ID on top).
#[derive(Debug, Clone, Copy)]
pub struct AnyTypeValue {
    pub value: AnyBaseValue,
    pub data_type_id: u16,
}

/// A type that can cross the native-call boundary via the value stack.
pub trait StackValued: Sized {
    fn data_type() -> DataTypeRef;
    fn pop_value(context: &mut ExecContext<'_>) -> Self;
    fn push_value(self, context: &mut ExecContext<'_>);
}

macro_rules! impl_stack_valued {
    ($ty:ty, $data_type:expr) => {
        impl StackValued for $ty {
            fn data_type() -> DataTypeRef {
                $data_type
            }
            fn pop_value(context: &mut ExecContext<'_>) -> Self {
                context.flow.pop::<$ty>()
            }
            fn push_value(self, context: &mut ExecContext<'_>) {
                context.flow.push(self);
            }
        }
    };
}

impl_stack_valued!(i8, PredefinedDataTypes::i8());
impl_stack_valued!(u8, PredefinedDataTypes::u8());
impl_stack_valued!(i16, PredefinedDataTypes::i16());
impl_stack_valued!(u16, PredefinedDataTypes::u16());
impl_stack_valued!(i32, PredefinedDataTypes::i32());
impl_stack_valued!(u32, PredefinedDataTypes::u32());
impl_stack_valued!(i64, PredefinedDataTypes::i64());
impl_stack_valued!(u64, PredefinedDataTypes::u64());
impl_stack_valued!(bool, PredefinedDataTypes::bool_type());
impl_stack_valued!(f32, PredefinedDataTypes::float());
impl_stack_valued!(f64, PredefinedDataTypes::double());

impl StackValued for StringRef {
    fn data_type() -> DataTypeRef {
        PredefinedDataTypes::string()
    }
    fn pop_value(context: &mut ExecContext<'_>) -> Self {
        StringRef::new(context.flow.pop::<u64>())
    }
    fn push_value(self, context: &mut ExecContext<'_>) {
        context.flow.push(self.hash);
    }
}

impl StackValued for ArrayRef {
    fn data_type() -> DataTypeRef {
        // Array handles are u32 cells at the ABI level.
        PredefinedDataTypes::u32()
    }
    fn pop_value(context: &mut ExecContext<'_>) -> Self {
        ArrayRef {
            id: context.flow.pop::<u32>(),
        }
    }
    fn push_value(self, context: &mut ExecContext<'_>) {
        context.flow.push(self.id);
    }
}

impl StackValued for AnyTypeValue {
    fn data_type() -> DataTypeRef {
        PredefinedDataTypes::any()
    }
    fn pop_value(context: &mut ExecContext<'_>) -> Self {
        let data_type_id = context.flow.pop::<u64>() as u16;
        let value = AnyBaseValue::from_raw(context.flow.pop::<u64>());
        AnyTypeValue {
            value,
            data_type_id,
        }
    }
    fn push_value(self, context: &mut ExecContext<'_>) {
        context.flow.push(self.value.raw());
        context.flow.push(self.data_type_id as u64);
    }
}

/// Return position of a native callable: either void or a stack value.
pub trait NativeReturn {
    fn return_type() -> DataTypeRef;
    fn push_return(self, context: &mut ExecContext<'_>);
}

impl NativeReturn for () {
    fn return_type() -> DataTypeRef {
        PredefinedDataTypes::void()
    }
    fn push_return(self, _context: &mut ExecContext<'_>) {}
}

impl<T: StackValued> NativeReturn for T {
    fn return_type() -> DataTypeRef {
        T::data_type()
    }
    fn push_return(self, context: &mut ExecContext<'_>) {
        self.push_value(context);
    }
}

/// Marker type for context-taking callables.
pub struct WithContext;

/// Conversion from a host callable into a [`NativeFunctionWrapper`].
///
/// Implemented for plain `Fn(args…) -> R` and for context-taking
/// `Fn(&mut ExecContext, args…) -> R` up to four script-visible parameters.
pub trait IntoNativeWrapper<Marker> {
    fn into_native_wrapper(self) -> NativeFunctionWrapper;
}

macro_rules! impl_plain_callable {
    ($( $param:ident ),* ; $( $rev:ident ),*) => {
        impl<Fun, Ret, $($param,)*> IntoNativeWrapper<(Ret, $($param,)*)> for Fun
        where
            Fun: Fn($($param),*) -> Ret + Send + Sync + 'static,
            Ret: NativeReturn,
            $($param: StackValued + 'static,)*
        {
            fn into_native_wrapper(self) -> NativeFunctionWrapper {
                NativeFunctionWrapper {
                    return_type: Ret::return_type(),
                    parameter_types: vec![$($param::data_type()),*],
                    callable: Box::new(move |context| {
                        // Pop in reverse push order.
                        #[allow(non_snake_case)]
                        {
                            $(let $rev = $rev::pop_value(context);)*
                            let result = (self)($($param),*);
                            result.push_return(context);
                        }
                    }),
                }
            }
        }
    };
}

macro_rules! impl_context_callable {
    ($( $param:ident ),* ; $( $rev:ident ),*) => {
        impl<Fun, Ret, $($param,)*> IntoNativeWrapper<(WithContext, Ret, $($param,)*)> for Fun
        where
            Fun: for<'a, 'b> Fn(&'a mut ExecContext<'b>, $($param),*) -> Ret + Send + Sync + 'static,
            Ret: NativeReturn,
            $($param: StackValued + 'static,)*
        {
            fn into_native_wrapper(self) -> NativeFunctionWrapper {
                NativeFunctionWrapper {
                    return_type: Ret::return_type(),
                    parameter_types: vec![$($param::data_type()),*],
                    callable: Box::new(move |context| {
                        #[allow(non_snake_case)]
                        {
                            $(let $rev = $rev::pop_value(context);)*
                            let result = (self)(context, $($param),*);
                            result.push_return(context);
                        }
                    }),
                }
            }
        }
    };
}

impl_plain_callable!( ; );
impl_plain_callable!(A ; A);
impl_plain_callable!(A, B ; B, A);
impl_plain_callable!(A, B, C ; C, B, A);
impl_plain_callable!(A, B, C, D ; D, C, B, A);

impl_context_callable!( ; );
impl_context_callable!(A ; A);
impl_context_callable!(A, B ; B, A);
impl_context_callable!(A, B, C ; C, B, A);
impl_context_callable!(A, B, C, D ; D, C, B, A);

/// Wrap any supported callable into a native function wrapper.
pub fn wrap<Marker, F: IntoNativeWrapper<Marker>>(callable: F) -> NativeFunctionWrapper {
    callable.into_native_wrapper()
}

/// Function-ID-indexed registry of native wrappers, used by the compiler
/// to evaluate `COMPILE_TIME_CONSTANT` natives during token processing.
#[derive(Default)]
pub struct NativeRegistry {
    wrappers: std::collections::HashMap<u32, std::sync::Arc<NativeFunctionWrapper>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        NativeRegistry::default()
    }

    /// Share all native wrappers of a module.
    pub fn register_module(&mut self, module: &crate::module::Module) {
        for native in module.native_functions() {
            self.wrappers.insert(native.info.id, native.wrapper.clone());
        }
    }

    pub fn wrapper(&self, function_id: u32) -> Option<&std::sync::Arc<NativeFunctionWrapper>> {
        self.wrappers.get(&function_id)
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }
}
