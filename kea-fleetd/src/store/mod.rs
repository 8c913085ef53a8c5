pub mod commit;
pub mod db;
pub mod hash;
pub mod stats;
