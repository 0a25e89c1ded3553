mod painter;
mod replay_view;
mod table;

pub(crate) use self::painter::Painter;
pub(crate) use self::replay_view::ReplayReportView;
pub(crate) use self::table::Table;
