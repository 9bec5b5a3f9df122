mod device_view;
mod painter;
mod snapshot_view;
mod table;
mod update_view;

pub(crate) use self::painter::Painter;
pub(crate) use self::snapshot_view::SnapshotView;
pub(crate) use self::update_view::UpdateView;
