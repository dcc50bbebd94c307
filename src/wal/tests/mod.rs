pub mod helpers;
mod tests_corruption;
