pub mod composer;
pub mod library;
pub mod meme;
