mod progress;
mod status;
mod table;

pub use progress::{chunk_bar, spinner_bar};
pub use status::{print_command_status, CommandStatus};
pub use table::{align_right, apply_column_padding, header, styled_table};
