pub mod candidates;
pub mod fallback;
pub mod similarity;
pub mod string_distance;
pub mod tokenizer;
