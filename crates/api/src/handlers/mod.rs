pub mod gpu;
pub mod health;
pub mod recharge;
pub mod tasks;
