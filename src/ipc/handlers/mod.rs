pub mod backup;
pub mod core;
pub mod criteria;
pub mod grades;
pub mod honors;
pub mod roster;
