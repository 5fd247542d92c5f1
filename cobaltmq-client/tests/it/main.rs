mod helper;

mod conn;
mod consume;
mod get;
mod publish;
mod queue;
