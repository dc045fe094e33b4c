mod fetch;
mod filesystem;
mod revalidation;
mod utils;
