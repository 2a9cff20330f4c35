pub mod budget;
pub mod effect;
pub mod hold;
pub mod intent;
pub mod simulation;
