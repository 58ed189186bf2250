pub mod books;

pub use books::Entity as Books;
