//! Periodic status/config dumps to the sink.
//!
//! Three independent timers drive this: status (hosts + services), program
//! status, and the full config dump framed by start/end sentinels. The key
//! numbers follow the consumer's schema; fields the daemon does not track
//! are emitted with the fixed values the consumer expects.

use crate::daemon::metrics;
use crate::objects::{Host, Objects, Service};

use super::records::{Record, goodbye, hello, timestamp, typecode};
use super::sink::RecordSink;

pub struct Exporter {
    sink: Box<dyn RecordSink>,
    start_ms: u64,
    pid: u32,
}

impl Exporter {
    pub fn new(sink: Box<dyn RecordSink>, start_ms: u64, pid: u32) -> Self {
        Self {
            sink,
            start_ms,
            pid,
        }
    }

    pub fn hello_payload(&self, instance_name: &str) -> String {
        hello(instance_name, self.start_ms / 1000)
    }

    pub fn send_goodbye(&self, now_ms: u64) {
        self.sink.send(goodbye(now_ms / 1000));
    }

    /// Status timer: one record per host and per service.
    pub fn dump_status(&self, objects: &Objects, now_ms: u64) {
        let mut records = 0usize;
        for host in objects.hosts() {
            self.sink.send(self.host_status(host, now_ms));
            records += 1;
        }
        for service in objects.services() {
            self.sink.send(self.service_status(service, now_ms));
            records += 1;
        }
        metrics::export_records(records);
    }

    /// Program-status timer: a single program-wide record.
    pub fn dump_program_status(&self, now_ms: u64) {
        self.sink.send(self.program_status(now_ms));
        metrics::export_records(1);
    }

    /// Config timer: full object dump framed by start/end sentinels.
    pub fn dump_config(&self, objects: &Objects, now_ms: u64) {
        let ts = timestamp(now_ms);
        let mut records = 2usize;

        self.sink.send(
            Record::sentinel(typecode::CONFIG_DUMP_START)
                .field(245, "RETAINED") /* configdumptype */
                .field(4, ts) /* timestamp */
                .finish(),
        );

        for host in objects.hosts() {
            self.sink.send(self.host_definition(host, now_ms));
            records += 1;
        }
        for (name, members) in objects.host_groups() {
            let mut record = Record::new(typecode::HOSTGROUP_DEFINITION)
                .field(4, ts) /* timestamp */
                .field(172, &name) /* hostgroupname */
                .field(170, &name); /* hostgroupalias */
            for member in members {
                record = record.field(171, member); /* hostgroupmember */
            }
            self.sink.send(record.finish());
            records += 1;
        }

        for service in objects.services() {
            self.sink.send(self.service_definition(service, now_ms));
            records += 1;
        }
        for (name, members) in objects.service_groups() {
            let mut record = Record::new(typecode::SERVICEGROUP_DEFINITION)
                .field(4, ts) /* timestamp */
                .field(220, &name) /* servicegroupname */
                .field(218, &name); /* servicegroupalias */
            for (host, service) in members {
                record = record.field(219, format!("{host},{service}")); /* servicegroupmember */
            }
            self.sink.send(record.finish());
            records += 1;
        }

        self.sink.send(
            Record::sentinel(typecode::CONFIG_DUMP_END)
                .field(4, ts) /* timestamp */
                .finish(),
        );
        metrics::export_records(records);
    }

    fn host_status(&self, host: &Host, now_ms: u64) -> String {
        let now_secs = now_ms / 1000;
        Record::new(typecode::HOST_STATUS)
            .field(1, "") /* type */
            .field(2, "") /* flags */
            .field(3, "") /* attributes */
            .field(4, timestamp(now_ms)) /* timestamp */
            .field(53, &host.name) /* host */
            .field(95, "") /* output */
            .field(125, "") /* longoutput */
            .field(99, "") /* perfdata */
            .field(27, "") /* currentstate */
            .field(51, 1) /* hasbeenchecked */
            .field(115, 1) /* shouldbescheduled */
            .field(25, 1) /* currentcheckattempt */
            .field(76, 1) /* maxcheckattempts */
            .field(58, now_secs) /* lasthostcheck */
            .field(81, now_secs) /* nexthostcheck */
            .field(12, "") /* checktype */
            .field(63, "") /* laststatechange */
            .field(57, "") /* lasthardstatechange */
            .field(56, "") /* lasthardstate */
            .field(69, "") /* lasttimeup */
            .field(65, "") /* lasttimedown */
            .field(68, "") /* lasttimeunreachable */
            .field(121, "") /* statetype */
            .field(59, "") /* lasthostnotification */
            .field(82, "") /* nexthostnotification */
            .field(85, 0) /* nomorenotifications */
            .field(88, 0) /* notificationsenabled */
            .field(101, 0) /* problemhasbeenacknowledged */
            .field(7, "") /* acknowledgementtype */
            .field(26, 0) /* currentnotificationnumber */
            .field(96, 1) /* passivehostchecksenabled */
            .field(38, "") /* eventhandlerenabled */
            .field(8, "") /* activehostchecksenabled */
            .field(47, "") /* flapdetectionenabled */
            .field(54, "") /* isflapping */
            .field(98, "") /* percentstatechange */
            .field(71, "") /* latency */
            .field(42, "") /* executiontime */
            .field(113, 0) /* scheduleddowntimedepth */
            .field(45, "") /* failurepredictionsenabled */
            .field(103, 1) /* processperformancedata */
            .field(91, 0) /* obsessoverhost */
            .field(78, "") /* modifiedattributes */
            .field(37, "") /* eventhandler */
            .field(11, "virtual-check") /* checkcommand */
            .field(86, "") /* normalcheckinterval */
            .field(109, "") /* retrycheckinterval */
            .field(162, "") /* hostcheckperiod */
            .finish()
    }

    fn service_status(&self, service: &Service, now_ms: u64) -> String {
        let now_secs = now_ms / 1000;
        let next_check = now_secs + service.check_interval_secs;
        Record::new(typecode::SERVICE_STATUS)
            .field(1, "") /* type */
            .field(2, "") /* flags */
            .field(3, "") /* attributes */
            .field(4, timestamp(now_ms)) /* timestamp */
            .field(53, &service.host) /* host */
            .field(114, &service.alias) /* service */
            .field(95, "") /* output */
            .field(125, "") /* longoutput */
            .field(99, "") /* perfdata */
            .field(27, 3) /* currentstate */
            .field(51, 0) /* hasbeenchecked */
            .field(115, 1) /* shouldbescheduled */
            .field(25, 1) /* currentcheckattempt */
            .field(76, 1) /* maxcheckattempts */
            .field(61, now_secs) /* lastservicecheck */
            .field(83, next_check) /* nextservicecheck */
            .field(12, "") /* checktype */
            .field(63, 0) /* laststatechange */
            .field(57, 0) /* lasthardstatechange */
            .field(56, "") /* lasthardstate */
            .field(66, "") /* lasttimeok */
            .field(70, "") /* lasttimewarning */
            .field(67, "") /* lasttimeunknown */
            .field(64, "") /* lasttimecritical */
            .field(121, 1) /* statetype */
            .field(62, "") /* lastservicenotification */
            .field(84, "") /* nextservicenotification */
            .field(85, 0) /* nomorenotifications */
            .field(88, 0) /* notificationsenabled */
            .field(101, 0) /* problemhasbeenacknowledged */
            .field(7, "") /* acknowledgementtype */
            .field(26, 0) /* currentnotificationnumber */
            .field(97, "") /* passiveservicechecksenabled */
            .field(38, "") /* eventhandlerenabled */
            .field(9, "") /* activeservicechecksenabled */
            .field(47, "") /* flapdetectionenabled */
            .field(54, "") /* isflapping */
            .field(98, "") /* percentstatechange */
            .field(71, 0) /* latency */
            .field(42, 0) /* executiontime */
            .field(113, 0) /* scheduleddowntimedepth */
            .field(45, 0) /* failurepredictionsenabled */
            .field(103, 1) /* processperformancedata */
            .field(93, 0) /* obsessoverservice */
            .field(80, 0) /* modifiedserviceattributes */
            .field(37, "") /* eventhandler */
            .field(11, "virtual-check") /* checkcommand */
            .field(86, service.check_interval_secs as f64 / 60.0) /* normalcheckinterval */
            .field(109, service.check_interval_secs as f64 / 60.0) /* retrycheckinterval */
            .field(209, "") /* servicecheckperiod */
            .finish()
    }

    fn program_status(&self, now_ms: u64) -> String {
        Record::new(typecode::PROGRAM_STATUS)
            .field(1, "") /* type */
            .field(2, "") /* flags */
            .field(3, "") /* attributes */
            .field(4, timestamp(now_ms)) /* timestamp */
            .field(106, self.start_ms / 1000) /* programstarttime */
            .field(102, self.pid) /* processid */
            .field(28, 1) /* daemonmode */
            .field(55, "") /* lastcommandcheck */
            .field(60, "") /* lastlogrotation */
            .field(88, "") /* notificationsenabled */
            .field(9, 1) /* activeservicechecksenabled */
            .field(97, 1) /* passiveservicechecksenabled */
            .field(8, 0) /* activehostchecksenabled */
            .field(96, 0) /* passivehostchecksenabled */
            .field(39, 0) /* eventhandlersenabled */
            .field(47, 1) /* flapdetectionenabled */
            .field(45, 0) /* failurepredictionenabled */
            .field(103, 1) /* processperformancedata */
            .field(92, 0) /* obsessoverhosts */
            .field(94, 0) /* obsessoverservices */
            .field(78, 0) /* modifiedhostattributes */
            .field(80, 0) /* modifiedserviceattributes */
            .field(49, "") /* globalhosteventhandler */
            .field(50, "") /* globalserviceeventhandler */
            .field(270, "") /* disablednotificationsexpiretime */
            .finish()
    }

    fn host_definition(&self, host: &Host, now_ms: u64) -> String {
        Record::new(typecode::HOST_DEFINITION)
            .field(4, timestamp(now_ms)) /* timestamp */
            .field(174, &host.name) /* hostname */
            .field(258, &host.alias) /* displayname */
            .field(159, &host.alias) /* hostalias */
            .field(158, "") /* hostaddress */
            .field(266, "") /* hostaddress6 */
            .field(160, "") /* hostcheckcommand */
            .field(163, "") /* hosteventhandler */
            .field(177, "") /* hostnotificationperiod */
            .field(162, "") /* hostcheckperiod */
            .field(166, "") /* hostfailurepredictionoptions */
            .field(161, 1) /* hostcheckinterval */
            .field(247, 1) /* hostretryinterval */
            .field(173, 1) /* hostmaxcheckattempts */
            .field(246, 0) /* firstnotificationdelay */
            .field(176, 0) /* hostnotificationinterval */
            .field(189, 0) /* notifyhostdown */
            .field(192, 0) /* notifyhostunreachable */
            .field(191, 0) /* notifyhostrecovery */
            .field(190, 0) /* notifyhostflapping */
            .field(248, 0) /* notifyhostdowntime */
            .field(167, 0) /* hostflapdetectionenabled */
            .field(251, 0) /* flapdetectiononup */
            .field(252, 0) /* flapdetectionondown */
            .field(253, 0) /* flapdetectiononunreachable */
            .field(183, 0) /* lowhostflapthreshold */
            .field(156, 0) /* highhostflapthreshold */
            .field(230, 0) /* stalkhostonup */
            .field(228, 0) /* stalkhostondown */
            .field(229, 0) /* stalkhostonunreachable */
            .field(168, 0) /* hostfreshnesschecksenabled */
            .field(169, 0) /* hostfreshnessthreshold */
            .field(201, 1) /* processhostperformancedata */
            .field(8, 1) /* activehostchecksenabled */
            .field(96, 1) /* passivehostchecksenabled */
            .field(164, 0) /* hosteventhandlerenabled */
            .field(204, 1) /* retainhoststatusinformation */
            .field(203, 1) /* retainhostnonstatusinformation */
            .field(178, 1) /* hostnotificationsenabled */
            .field(165, 0) /* hostfailurepredictionenabled */
            .field(91, 0) /* obsessoverhost */
            .field(186, "") /* notes */
            .field(187, "") /* notesurl */
            .field(126, "") /* actionurl */
            .field(179, "") /* iconimage */
            .field(180, "") /* iconimagealt */
            .field(239, "") /* vrmlimage */
            .field(235, "") /* statusmapimage */
            .field(154, 0) /* have2dcoords */
            .field(240, 0.0) /* x2d */
            .field(242, 0.0) /* y2d */
            .field(155, 0) /* have3dcoords */
            .field(241, 0.0) /* x3d */
            .field(243, 0.0) /* y3d */
            .field(244, 0.0) /* z3d */
            .field(200, "") /* parenthost */
            .field(130, "") /* contactgroup */
            .field(264, "") /* contact */
            .finish()
    }

    fn service_definition(&self, service: &Service, now_ms: u64) -> String {
        Record::new(typecode::SERVICE_DEFINITION)
            .field(4, timestamp(now_ms)) /* timestamp */
            .field(174, &service.host) /* hostname */
            .field(258, &service.alias) /* displayname */
            .field(210, &service.alias) /* servicedescription */
            .field(207, "virtual-check") /* servicecheckcommand */
            .field(211, "") /* serviceeventhandler */
            .field(224, "") /* servicenotificationperiod */
            .field(209, "") /* servicecheckperiod */
            .field(214, "") /* servicefailurepredictionoptions */
            .field(208, service.check_interval_secs as f64 / 60.0) /* servicecheckinterval */
            .field(226, 1) /* serviceretryinterval */
            .field(185, 1) /* maxservicecheckattempts */
            .field(246, 0) /* firstnotificationdelay */
            .field(223, 0) /* servicenotificationinterval */
            .field(196, 0) /* notifyserviceunknown */
            .field(197, 0) /* notifyservicewarning */
            .field(193, 0) /* notifyservicecritical */
            .field(195, 0) /* notifyservicerecovery */
            .field(194, 0) /* notifyserviceflapping */
            .field(249, 0) /* notifyservicedowntime */
            .field(232, 0) /* stalkserviceonok */
            .field(234, 0) /* stalkserviceonwarning */
            .field(233, 0) /* stalkserviceonunknown */
            .field(231, 0) /* stalkserviceoncritical */
            .field(221, 0) /* serviceisvolatile */
            .field(215, 0) /* serviceflapdetectionenabled */
            .field(254, 0) /* flapdetectiononok */
            .field(255, 0) /* flapdetectiononwarning */
            .field(256, 0) /* flapdetectiononunknown */
            .field(257, 0) /* flapdetectiononcritical */
            .field(184, 0) /* lowserviceflapthreshold */
            .field(157, 0) /* highserviceflapthreshold */
            .field(202, 1) /* processserviceperformancedata */
            .field(216, 0) /* servicefreshnesschecksenabled */
            .field(217, 0) /* servicefreshnessthreshold */
            .field(97, 1) /* passiveservicechecksenabled */
            .field(212, 0) /* serviceeventhandlerenabled */
            .field(9, 1) /* activeservicechecksenabled */
            .field(206, 1) /* retainservicestatusinformation */
            .field(205, 1) /* retainservicenonstatusinformation */
            .field(225, 0) /* servicenotificationsenabled */
            .field(93, 0) /* obsessoverservice */
            .field(213, 0) /* servicefailurepredictionenabled */
            .field(186, "") /* notes */
            .field(187, "") /* notesurl */
            .field(126, "") /* actionurl */
            .field(179, "") /* iconimage */
            .field(180, "") /* iconimagealt */
            .field(130, "") /* contactgroup */
            .field(264, "") /* contact */
            .finish()
    }
}
