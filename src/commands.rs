pub mod check_mail;
pub mod register;
