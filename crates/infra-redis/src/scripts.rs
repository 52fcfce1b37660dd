// Script runtime - versioned Lua resources, content-addressed on load.
//
// Each command is the shared includes concatenated with its body, wrapped in
// `redis::Script`, which invokes by SHA1 and falls back to a full EVAL on
// NOSCRIPT. Scripts are therefore loaded once per connection.

use redis::Script;

const INCLUDES: &str = include_str!("commands/includes.lua");

macro_rules! commands {
    ($($field:ident => $file:literal),+ $(,)?) => {
        /// The atomic state machine, one handle per command script.
        pub struct Scripts {
            $(pub $field: Script,)+
        }

        impl Scripts {
            pub fn new() -> Self {
                Self {
                    $($field: bundle(include_str!(concat!("commands/", $file))),)+
                }
            }
        }
    };
}

commands! {
    add_job => "add_job.lua",
    move_to_active => "move_to_active.lua",
    move_to_finished => "move_to_finished.lua",
    move_to_delayed => "move_to_delayed.lua",
    move_to_waiting_children => "move_to_waiting_children.lua",
    extend_lock => "extend_lock.lua",
    move_stalled_jobs => "move_stalled_jobs.lua",
    retry_job => "retry_job.lua",
    promote => "promote.lua",
    pause => "pause.lua",
    remove_job => "remove_job.lua",
    update_progress => "update_progress.lua",
    add_log => "add_log.lua",
    change_priority => "change_priority.lua",
    clean_jobs => "clean_jobs.lua",
    drain => "drain.lua",
    obliterate => "obliterate.lua",
    upsert_repeatable => "upsert_repeatable.lua",
    remove_repeatable => "remove_repeatable.lua",
    advance_repeatable => "advance_repeatable.lua",
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Full source of the add script, for pipelined EVAL inside MULTI (flows).
pub fn add_job_source() -> String {
    bundle_source(include_str!("commands/add_job.lua"))
}

fn bundle(body: &str) -> Script {
    Script::new(&bundle_source(body))
}

fn bundle_source(body: &str) -> String {
    format!("{}\n{}", INCLUDES, body)
}
