
pub use crate::error::StackError;
pub use crate::mac::{Address, MacAddr, Protocol, RxOptions, TxOptions};
pub use crate::mem::{Arena, Handle, MemError};
pub use crate::netmsg::NetmsgFlags;
pub use crate::radio::{Mode, Radio, RxFrame, TxMode, TxStatus};
pub use crate::route::{DestFlags, Route, RouteQuery};
pub use crate::sched::{Disposition, Signals, TaskState};
pub use crate::socket::{SockAddr, SockOptions, SocketHandle};
pub use crate::stack::{Core, Stack};
pub use crate::timer::Timer;
pub use crate::timesync::{NtpTimestamp, TimeFlags};
pub use crate::{StackConfig, Ts, Warnings};
