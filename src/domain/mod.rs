pub mod entities;
pub mod errors;
pub mod repositories;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod concurrency_tests;
