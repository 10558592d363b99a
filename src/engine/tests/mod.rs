pub mod helpers;
mod tests_registry;
