pub mod audit;
pub mod config;
pub mod converter;
pub mod error;
pub mod frontmatter;
pub mod identity;
pub mod ingest;
pub mod layout;
pub mod markup;
pub mod publish;
pub mod record;
pub mod replay;
pub mod route;
pub mod runtime;
pub mod scm;
pub mod store;
