// Media service backends

pub mod ytdlp;

pub use ytdlp::YtDlpCli;
