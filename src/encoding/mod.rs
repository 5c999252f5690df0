//! Storage encodings: order-preserving key encoding for engine keys, and
//! bincode for values that don't need to sort.

pub mod bincode;
pub mod keycode;
