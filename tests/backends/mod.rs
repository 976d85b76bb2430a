pub mod foundation_reactive;
