//! Data placement: static distribution of relations, node resolution and
//! the distribution descriptors attached to candidate paths.

pub mod locator;
pub mod qualifier;
pub mod reduce;
pub mod resolver;

#[cfg(test)]
mod tests;
