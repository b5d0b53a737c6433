//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. `EventType` and
/// `BufferedRecord` are value objects: once built they never change, and two
/// instances with the same attributes are interchangeable.
///
/// The trait requires:
/// - **Clone**: values are copied, not shared by reference
/// - **PartialEq**: compared by their attribute values
/// - **Debug**: loggable and testable
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
