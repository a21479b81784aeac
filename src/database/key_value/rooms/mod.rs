mod auth_chain;
mod head;
mod refs;
mod short;
mod state;
mod timeline;

impl crate::service::rooms::Data for crate::database::KeyValueDatabase {}
