use crate::cmd::RunArgs;
use crate::daemon;
use crate::exit::DaemonResult;

pub fn run(args: RunArgs) -> DaemonResult<i32> {
    daemon::run(args)
}
