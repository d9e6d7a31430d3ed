pub mod helpers;

mod tests_durability;
