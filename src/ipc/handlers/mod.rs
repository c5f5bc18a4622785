pub mod academic;
pub mod classes;
pub mod core;
pub mod periods;
pub mod rooms;
pub mod schedules;
pub mod subjects;
pub mod substitutions;
pub mod teachers;
