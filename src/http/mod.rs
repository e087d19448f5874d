pub mod uri_stripper;

pub use uri_stripper::strip_prefix;
