use comfy_table::{presets::NOTHING, Attribute, Cell, CellAlignment, ContentArrangement, Table};

/// Borderless, non-wrapping table used by every listing.
pub fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Disabled);
    table
}

/// Apply padding to all columns (call after setting headers)
pub fn apply_column_padding(table: &mut Table, padding: (u16, u16)) {
    for i in 0..table.column_count() {
        if let Some(col) = table.column_mut(i) {
            col.set_padding(padding);
        }
    }
}

/// Right-align the given columns; counts read better that way.
pub fn align_right(table: &mut Table, columns: &[usize]) {
    for idx in columns {
        if let Some(col) = table.column_mut(*idx) {
            col.set_cell_alignment(CellAlignment::Right);
        }
    }
}

pub fn header(text: &str) -> Cell {
    Cell::new(text)
        .add_attribute(Attribute::Bold)
        .add_attribute(Attribute::Dim)
}
