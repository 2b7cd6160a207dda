pub mod spin_barrier;
