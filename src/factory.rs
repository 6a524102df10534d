//! Value construction for map-mode pools.
//!
//! A factory is the "argument bundle" handed to `acquire_with`. The pool
//! calls [`ValueFactory::build`] at most once, and only after it has
//! confirmed under its exclusive locks that the key is absent. When the
//! key already exists the factory is dropped without being built.
//!
//! Provided factories:
//! - any `FnOnce() -> V` closure;
//! - [`Args`], forwarding through `V: From<A>`;
//! - [`Fallible`], for construction that can fail;
//! - [`Shared`] and [`Boxed`], building `Arc<T>` / `Box<T>` from `T: From<A>`
//!   with the pointee allocated together with its control block.

use std::convert::Infallible;
use std::sync::Arc;

/// Builds a pool value of type `V`.
pub trait ValueFactory<V> {
    /// Error surfaced to the caller of `try_acquire_with` when building fails.
    type Error;

    fn build(self) -> Result<V, Self::Error>;
}

impl<V, F> ValueFactory<V> for F
where
    F: FnOnce() -> V,
{
    type Error = Infallible;

    #[inline]
    fn build(self) -> Result<V, Infallible> {
        Ok(self())
    }
}

/// Forward a constructor argument through `From`.
#[derive(Clone, Debug)]
pub struct Args<A>(pub A);

impl<V, A> ValueFactory<V> for Args<A>
where
    V: From<A>,
{
    type Error = Infallible;

    #[inline]
    fn build(self) -> Result<V, Infallible> {
        Ok(V::from(self.0))
    }
}

/// Wrap a fallible constructor; its error is returned by `try_acquire_with`.
#[derive(Clone, Debug)]
pub struct Fallible<F>(pub F);

impl<V, E, F> ValueFactory<V> for Fallible<F>
where
    F: FnOnce() -> Result<V, E>,
{
    type Error = E;

    #[inline]
    fn build(self) -> Result<V, E> {
        (self.0)()
    }
}

/// Build an `Arc<T>` from `T: From<A>`.
#[derive(Clone, Debug)]
pub struct Shared<A>(pub A);

impl<T, A> ValueFactory<Arc<T>> for Shared<A>
where
    T: From<A>,
{
    type Error = Infallible;

    #[inline]
    fn build(self) -> Result<Arc<T>, Infallible> {
        Ok(Arc::new(T::from(self.0)))
    }
}

/// Build a `Box<T>` from `T: From<A>`.
#[derive(Clone, Debug)]
pub struct Boxed<A>(pub A);

impl<T, A> ValueFactory<Box<T>> for Boxed<A>
where
    T: From<A>,
{
    type Error = Infallible;

    #[inline]
    fn build(self) -> Result<Box<T>, Infallible> {
        Ok(Box::new(T::from(self.0)))
    }
}
