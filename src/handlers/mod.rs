pub mod meme;
pub mod statistics;
