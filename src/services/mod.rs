pub mod channels;
pub mod dispatcher;
pub mod init;
pub mod push;
pub mod registrar;
pub mod reminders;
pub mod scheduler;
pub mod session;
pub mod worker;
