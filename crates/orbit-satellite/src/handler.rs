//! Typed export handlers.
//!
//! A native handler is any `Fn(&CallContext, P1, .., Pn) -> R` where every
//! `Pi` is a [`Primitive`] and `R` implements [`IntoResults`]. The
//! signature is derived from those types, so it can never leave the closed
//! set of value types.

use std::sync::Arc;

use orbit_core::{InstanceId, Primitive, ValueType};

use crate::error::{HandlerError, HandlerResult};
use crate::memory::MemoryClient;

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The guest instance that made the call.
    pub instance: InstanceId,
    /// The memory of that instance.
    pub memory: MemoryClient,
}

/// The untyped form every handler is stored as.
pub type RawHandler = Arc<dyn Fn(&CallContext, &[u64]) -> HandlerResult<Vec<u64>> + Send + Sync>;

/// Return values of a native handler.
pub trait IntoResults {
    /// The declared result types.
    fn result_types() -> Vec<ValueType>;

    /// Encode into transport words.
    fn into_results(self) -> HandlerResult<Vec<u64>>;
}

impl IntoResults for () {
    fn result_types() -> Vec<ValueType> {
        Vec::new()
    }

    fn into_results(self) -> HandlerResult<Vec<u64>> {
        Ok(Vec::new())
    }
}

macro_rules! impl_into_results_primitive {
    ($($ty:ty),*) => {
        $(
            impl IntoResults for $ty {
                fn result_types() -> Vec<ValueType> {
                    vec![<$ty as Primitive>::TYPE]
                }

                fn into_results(self) -> HandlerResult<Vec<u64>> {
                    Ok(vec![self.into_word()])
                }
            }
        )*
    };
}

impl_into_results_primitive!(i32, i64, f32, f64);

macro_rules! impl_into_results_tuple {
    ($($ty:ident $var:ident),+) => {
        impl<$($ty: Primitive),+> IntoResults for ($($ty,)+) {
            fn result_types() -> Vec<ValueType> {
                vec![$(<$ty as Primitive>::TYPE),+]
            }

            fn into_results(self) -> HandlerResult<Vec<u64>> {
                let ($($var,)+) = self;
                Ok(vec![$($var.into_word()),+])
            }
        }
    };
}

impl_into_results_tuple!(A a, B b);
impl_into_results_tuple!(A a, B b, C c);
impl_into_results_tuple!(A a, B b, C c, D d);

impl<T: IntoResults> IntoResults for HandlerResult<T> {
    fn result_types() -> Vec<ValueType> {
        T::result_types()
    }

    fn into_results(self) -> HandlerResult<Vec<u64>> {
        self?.into_results()
    }
}

/// A function usable as a native export.
///
/// `Args` is the tuple of parameter types; it only exists to tell the
/// implementations for different arities apart.
pub trait NativeHandler<Args>: Send + Sync + 'static {
    /// The declared parameter types.
    fn param_types() -> Vec<ValueType>;

    /// The declared result types.
    fn result_types() -> Vec<ValueType>;

    /// Decode `inputs`, run the handler and encode its results.
    fn invoke(&self, ctx: &CallContext, inputs: &[u64]) -> HandlerResult<Vec<u64>>;

    /// Erase into a [`RawHandler`].
    fn into_raw(self) -> RawHandler
    where
        Self: Sized,
        Args: 'static,
    {
        Arc::new(move |ctx: &CallContext, inputs: &[u64]| self.invoke(ctx, inputs))
    }
}

macro_rules! impl_native_handler {
    ($($ty:ident $var:ident),*) => {
        impl<F, R, $($ty,)*> NativeHandler<($($ty,)*)> for F
        where
            F: Fn(&CallContext, $($ty),*) -> R + Send + Sync + 'static,
            R: IntoResults,
            $($ty: Primitive,)*
        {
            fn param_types() -> Vec<ValueType> {
                vec![$(<$ty as Primitive>::TYPE),*]
            }

            fn result_types() -> Vec<ValueType> {
                R::result_types()
            }

            #[allow(unused_variables, unused_mut)]
            fn invoke(&self, ctx: &CallContext, inputs: &[u64]) -> HandlerResult<Vec<u64>> {
                let expected = Self::param_types().len();
                if inputs.len() != expected {
                    return Err(HandlerError::new(format!(
                        "expected {expected} arguments, got {}",
                        inputs.len()
                    )));
                }
                let mut words = inputs.iter().copied();
                $(let $var = <$ty as Primitive>::from_word(words.next().unwrap_or_default());)*
                (self)(ctx, $($var),*).into_results()
            }
        }
    };
}

impl_native_handler!();
impl_native_handler!(A a);
impl_native_handler!(A a, B b);
impl_native_handler!(A a, B b, C c);
impl_native_handler!(A a, B b, C c, D d);
impl_native_handler!(A a, B b, C c, D d, E e);
impl_native_handler!(A a, B b, C c, D d, E e, G g);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::FakeMemory;
    use crate::memory::MemoryTransport;
    use orbit_core::{BrokerId, Value};

    fn ctx() -> CallContext {
        CallContext {
            instance: InstanceId(1),
            memory: MemoryClient::new(
                BrokerId(1),
                FakeMemory::with_size(0) as Arc<dyn MemoryTransport>,
            ),
        }
    }

    fn signature<Args, H: NativeHandler<Args>>(_handler: &H) -> (Vec<ValueType>, Vec<ValueType>) {
        (H::param_types(), H::result_types())
    }

    #[test]
    fn test_signature_from_types() {
        let add = |_: &CallContext, a: i32, b: i32| a.wrapping_add(b);
        assert_eq!(
            signature(&add),
            (vec![ValueType::I32, ValueType::I32], vec![ValueType::I32])
        );

        let split = |_: &CallContext, v: f64| -> (f32, i64) { (v as f32, v as i64) };
        assert_eq!(
            signature(&split),
            (vec![ValueType::F64], vec![ValueType::F32, ValueType::I64])
        );

        let noop = |_: &CallContext| {};
        assert_eq!(signature(&noop), (vec![], vec![]));
    }

    #[test]
    fn test_invoke_decodes_and_encodes() {
        let add = |_: &CallContext, a: i32, b: i32| a.wrapping_add(b);
        let inputs = [Value::I32(i32::MAX).encode(), Value::I32(1).encode()];
        let out = add.invoke(&ctx(), &inputs).unwrap();
        assert_eq!(Value::decode(ValueType::I32, out[0]), Value::I32(i32::MIN));
    }

    #[test]
    fn test_fallible_handler() {
        let checked = |_: &CallContext, a: i64| -> HandlerResult<i64> {
            a.checked_mul(2).ok_or_else(|| HandlerError::new("overflow"))
        };
        let raw = checked.into_raw();

        assert_eq!(raw(&ctx(), &[21]).unwrap(), vec![42]);
        let err = raw(&ctx(), &[Value::I64(i64::MAX).encode()]).unwrap_err();
        assert_eq!(err.message(), "overflow");
        assert!(raw(&ctx(), &[]).is_err());
    }
}
