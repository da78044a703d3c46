//! Entity trait: things that keep their identity while their fields change.

/// A recurring rule stays the same rule after every `advance`, so stores key
/// it by identity rather than by value.
pub trait Entity {
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> Self::Id;
}
