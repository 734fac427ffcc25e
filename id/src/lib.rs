// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Typed arena handles.
//!
//! Stores in this workspace own their objects in arenas and hand out small integer indices.
//! [`Id`] tags such an index with the type of the object it designates so that a nexthop index
//! cannot be passed where a flow or interface index is expected.
//!
//! The all-ones value is reserved as an invalid sentinel. Allocators return [`Id::INVALID`] when
//! their index space is exhausted instead of failing.

use core::fmt::{Debug, Formatter};
use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

#[allow(unused_imports)] // re-export
#[cfg(any(test, feature = "bolero"))]
pub use contract::*;

/// A `u32` index tagged at compile time with the type `T` it refers to.
///
/// ```
/// # use vrouter_id::Id;
/// struct NextHop;
/// struct Interface;
///
/// let nh: Id<NextHop> = Id::new(4);
/// let intf: Id<Interface> = Id::new(4);
/// assert_eq!(nh.as_u32(), intf.as_u32());
/// assert!(Id::<NextHop>::INVALID.is_invalid());
/// ```
///
/// ```rust,compile_fail
/// # use vrouter_id::Id;
/// # struct NextHop;
/// # struct Interface;
/// fn mixup(mut nh: Id<NextHop>, intf: Id<Interface>) {
///     nh = intf;
/// }
/// ```
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[repr(transparent)]
pub struct Id<T: ?Sized>(u32, #[cfg_attr(feature = "serde", serde(skip))] PhantomData<fn() -> T>);

impl<T: ?Sized> Id<T> {
    /// The reserved sentinel value.
    pub const INVALID: Id<T> = Id(u32::MAX, PhantomData);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw, PhantomData)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The index as a `usize`, for indexing arenas.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        !self.is_valid()
    }

    /// `Some(self)` unless this is the sentinel.
    #[must_use]
    pub const fn valid(self) -> Option<Self> {
        if self.is_valid() { Some(self) } else { None }
    }
}

impl<T: ?Sized> Copy for Id<T> {}

impl<T: ?Sized> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T: ?Sized> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: ?Sized> Eq for Id<T> {}

impl<T: ?Sized> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: ?Sized> Default for Id<T> {
    /// Defaults to the invalid sentinel.
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T: ?Sized> Display for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

impl<T: ?Sized> Debug for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl<T: ?Sized> From<u32> for Id<T> {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized> From<Id<T>> for u32 {
    fn from(value: Id<T>) -> Self {
        value.0
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use crate::Id;
    use bolero::{Driver, TypeGenerator};
    use std::marker::PhantomData;

    /// Only produces valid (non-sentinel) ids.
    impl<T: ?Sized + 'static> TypeGenerator for Id<T> {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            let raw: u32 = driver.produce()?;
            Some(Id(raw % u32::MAX, PhantomData))
        }
    }
}

#[cfg(test)]
mod test {
    use crate::Id;

    struct Marker;

    #[test]
    fn generated_ids_are_valid() {
        bolero::check!()
            .with_type()
            .for_each(|id: &Id<Marker>| assert!(id.is_valid()));
    }

    #[test]
    fn raw_round_trip_preserves_order() {
        bolero::check!()
            .with_type()
            .for_each(|(a, b): &(u32, u32)| {
                let (x, y) = (Id::<Marker>::new(*a), Id::<Marker>::new(*b));
                assert_eq!(x.cmp(&y), a.cmp(b));
                assert_eq!(u32::from(x), *a);
            });
    }

    #[test]
    fn sentinel() {
        let id = Id::<Marker>::default();
        assert!(id.is_invalid());
        assert_eq!(id.valid(), None);
        assert_eq!(id.to_string(), "invalid");
        assert_eq!(Id::<Marker>::new(7).valid(), Some(Id::new(7)));
        assert_eq!(Id::<Marker>::new(7).index(), 7);
    }
}
