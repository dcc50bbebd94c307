pub mod helpers;
mod tests_boundary;
mod tests_concurrent;
mod tests_iter;
mod tests_stress;
