use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static CLAPPER: Emoji<'_, '_> = Emoji("🎬 ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "     _                                                 ",
        " ___| |__   _____      ___ __ _   _ _ __  _ __   ___ _ __ ",
        "/ __| '_ \\ / _ \\ \\ /\\ / / '__| | | | '_ \\| '_ \\ / _ \\ '__|",
        "\\__ \\ | | | (_) \\ V  V /| |  | |_| | | | | | | |  __/ |   ",
        "|___/_| |_|\\___/ \\_/\\_/ |_|   \\__,_|_| |_|_| |_|\\___|_|   ",
    ];
    for line in lines {
        println!("{}", style(line).magenta().bold());
    }
    println!(
        "{}{}\n",
        CLAPPER,
        style("episodic content pipeline engine").dim()
    );
}

/// A titled block of commands for the help screen.
pub struct GuideSection {
    title: String,
    commands: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, cmd: &str, desc: &str) -> Self {
        self.commands.push((cmd.to_string(), desc.to_string()));
        self
    }

    pub fn print(self) {
        println!(" {}", style(&self.title).bold().underlined());
        for (cmd, desc) in &self.commands {
            println!("   {:<12} {}", style(cmd).green(), desc);
        }
        println!();
    }
}
